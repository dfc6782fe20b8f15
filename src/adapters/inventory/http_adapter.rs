//! HTTP inventory adapter. Implements InventoryPort against the store's
//! REST API.
//!
//! A 401 from any endpoint maps to `DomainError::SessionExpired`; the
//! services treat that as a batch-abort signal, never a per-unit failure.

use crate::domain::{DomainError, ItemFields, MatchType};
use crate::ports::{
    AttachmentPayload, AttachmentUpload, CandidateMatch, FieldPreferences, InventoryPort,
    MergeOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Inventory store API client.
pub struct HttpInventoryAdapter {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

#[derive(Serialize)]
struct CreateItemRequest<'a> {
    #[serde(flatten)]
    fields: &'a ItemFields,
    location_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateItemResponse {
    id: String,
}

#[derive(Serialize)]
struct MergeRequest<'a> {
    fields: &'a ItemFields,
    excluded_field: &'a str,
}

#[derive(Deserialize)]
struct MergeResponse {
    #[serde(default)]
    updated_fields: Vec<String>,
    #[serde(default)]
    skipped_fields: Vec<String>,
}

#[derive(Serialize)]
struct DuplicateCheckRequest<'a> {
    candidates: &'a [ItemFields],
}

#[derive(Deserialize)]
struct WireMatch {
    candidate_index: usize,
    item_id: String,
    item_name: String,
    match_type: MatchType,
    confidence: f32,
    similarity: f32,
}

#[derive(Deserialize)]
struct DuplicateCheckResponse {
    #[serde(default)]
    matches: Vec<WireMatch>,
}

#[derive(Deserialize)]
struct PreferencesResponse {
    default_label_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
}

#[derive(Deserialize)]
struct SessionResponse {
    valid: bool,
}

impl HttpInventoryAdapter {
    pub fn new(base_url: String, access_token: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url,
            access_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    /// Map transport and status errors. 401 is the session-expiry signal.
    async fn checked(
        &self,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, DomainError> {
        let response =
            response.map_err(|e| DomainError::Inventory(format!("network error: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DomainError::SessionExpired);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %text, "inventory API returned error");
            return Err(DomainError::Inventory(format!(
                "API error {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl InventoryPort for HttpInventoryAdapter {
    async fn create_item(
        &self,
        fields: &ItemFields,
        location_id: &str,
        parent_id: Option<&str>,
    ) -> Result<String, DomainError> {
        let request = CreateItemRequest {
            fields,
            location_id,
            parent_id,
        };
        let response = self
            .checked(
                self.client
                    .post(self.url("api/items"))
                    .bearer_auth(&self.access_token)
                    .json(&request)
                    .send()
                    .await,
            )
            .await?;

        let data: CreateItemResponse = response
            .json()
            .await
            .map_err(|e| DomainError::Inventory(format!("failed to parse response: {e}")))?;
        debug!(item_id = %data.id, name = %fields.name, "item created");
        Ok(data.id)
    }

    async fn upload_attachment(
        &self,
        item_id: &str,
        upload: &AttachmentUpload,
    ) -> Result<(), DomainError> {
        let part = match &upload.payload {
            AttachmentPayload::Bytes { data, mime } => {
                reqwest::multipart::Part::bytes(data.clone())
                    .file_name(upload.filename.clone())
                    .mime_str(mime)
                    .map_err(|e| DomainError::Inventory(format!("bad mime type: {e}")))?
            }
            AttachmentPayload::File(path) => {
                let contents = tokio::fs::read(path).await.map_err(|e| {
                    DomainError::Inventory(format!("read {}: {e}", path.display()))
                })?;
                reqwest::multipart::Part::bytes(contents).file_name(upload.filename.clone())
            }
        };
        let form = reqwest::multipart::Form::new().part("file", part);

        self.checked(
            self.client
                .post(self.url(&format!("api/items/{item_id}/attachments")))
                .bearer_auth(&self.access_token)
                .multipart(form)
                .send()
                .await,
        )
        .await?;
        Ok(())
    }

    async fn delete_item(&self, item_id: &str) -> Result<(), DomainError> {
        self.checked(
            self.client
                .delete(self.url(&format!("api/items/{item_id}")))
                .bearer_auth(&self.access_token)
                .send()
                .await,
        )
        .await?;
        Ok(())
    }

    async fn merge_item(
        &self,
        target_id: &str,
        fields: &ItemFields,
        excluded_field: &str,
    ) -> Result<MergeOutcome, DomainError> {
        let request = MergeRequest {
            fields,
            excluded_field,
        };
        let response = self
            .checked(
                self.client
                    .post(self.url(&format!("api/items/{target_id}/merge")))
                    .bearer_auth(&self.access_token)
                    .json(&request)
                    .send()
                    .await,
            )
            .await?;

        let data: MergeResponse = response
            .json()
            .await
            .map_err(|e| DomainError::Inventory(format!("failed to parse response: {e}")))?;
        Ok(MergeOutcome {
            updated_fields: data.updated_fields,
            skipped_fields: data.skipped_fields,
        })
    }

    async fn check_duplicates(
        &self,
        candidates: &[ItemFields],
    ) -> Result<Vec<CandidateMatch>, DomainError> {
        let response = self
            .checked(
                self.client
                    .post(self.url("api/items/duplicate-check"))
                    .bearer_auth(&self.access_token)
                    .json(&DuplicateCheckRequest { candidates })
                    .send()
                    .await,
            )
            .await?;

        let data: DuplicateCheckResponse = response
            .json()
            .await
            .map_err(|e| DomainError::Inventory(format!("failed to parse response: {e}")))?;
        Ok(data
            .matches
            .into_iter()
            .map(|m| CandidateMatch {
                candidate_index: m.candidate_index,
                existing_id: m.item_id,
                existing_name: m.item_name,
                match_type: m.match_type,
                confidence: m.confidence,
                similarity: m.similarity,
            })
            .collect())
    }

    async fn field_preferences(&self) -> Result<FieldPreferences, DomainError> {
        let response = self
            .checked(
                self.client
                    .get(self.url("api/preferences/fields"))
                    .bearer_auth(&self.access_token)
                    .send()
                    .await,
            )
            .await?;

        let data: PreferencesResponse = response
            .json()
            .await
            .map_err(|e| DomainError::Inventory(format!("failed to parse response: {e}")))?;
        Ok(FieldPreferences {
            default_label_id: data.default_label_id,
            label_ids: data.label_ids,
        })
    }

    async fn session_valid(&self) -> Result<bool, DomainError> {
        let result = self
            .checked(
                self.client
                    .get(self.url("api/auth/session"))
                    .bearer_auth(&self.access_token)
                    .send()
                    .await,
            )
            .await;

        match result {
            Ok(response) => {
                let data: SessionResponse = response
                    .json()
                    .await
                    .map_err(|e| DomainError::Inventory(format!("failed to parse response: {e}")))?;
                Ok(data.valid)
            }
            // The probe's whole job is to answer this question.
            Err(DomainError::SessionExpired) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(server: &mockito::Server) -> HttpInventoryAdapter {
        HttpInventoryAdapter::new(server.url(), "token-1".to_string())
    }

    #[tokio::test]
    async fn test_create_item_returns_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/items")
            .match_header("authorization", "Bearer token-1")
            .with_status(200)
            .with_body(r#"{"id": "itm-42"}"#)
            .create_async()
            .await;

        let id = adapter(&server)
            .create_item(&ItemFields::named("Lamp"), "loc-1", None)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(id, "itm-42");
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_session_expired() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/items")
            .with_status(401)
            .create_async()
            .await;

        let result = adapter(&server)
            .create_item(&ItemFields::named("Lamp"), "loc-1", None)
            .await;
        assert!(matches!(result, Err(DomainError::SessionExpired)));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_inventory_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/api/items/itm-1")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let result = adapter(&server).delete_item("itm-1").await;
        assert!(matches!(result, Err(DomainError::Inventory(_))));
    }

    #[tokio::test]
    async fn test_upload_attachment_sends_multipart() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/items/itm-1/attachments")
            .match_header(
                "content-type",
                mockito::Matcher::Regex("multipart/form-data.*".to_string()),
            )
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let upload = AttachmentUpload {
            filename: "photo.webp".to_string(),
            payload: AttachmentPayload::Bytes {
                data: b"webp".to_vec(),
                mime: "image/webp".to_string(),
            },
        };
        adapter(&server)
            .upload_attachment("itm-1", &upload)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_merge_parses_field_lists() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/items/itm-1/merge")
            .with_status(200)
            .with_body(r#"{"updated_fields": ["name", "notes"], "skipped_fields": ["serial"]}"#)
            .create_async()
            .await;

        let outcome = adapter(&server)
            .merge_item("itm-1", &ItemFields::named("Drill"), "serial")
            .await
            .unwrap();
        assert_eq!(outcome.updated_fields, vec!["name", "notes"]);
        assert_eq!(outcome.skipped_fields, vec!["serial"]);
    }

    #[tokio::test]
    async fn test_duplicate_check_parses_match_types() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{
            "matches": [{
                "candidate_index": 0,
                "item_id": "itm-9",
                "item_name": "Old drill",
                "match_type": "manufacturer_model",
                "confidence": 0.9,
                "similarity": 0.95
            }]
        }"#;
        server
            .mock("POST", "/api/items/duplicate-check")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let matches = adapter(&server)
            .check_duplicates(&[ItemFields::named("Drill")])
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].match_type, MatchType::ManufacturerModel);
        assert_eq!(matches[0].existing_id, "itm-9");
    }

    #[tokio::test]
    async fn test_session_probe_maps_unauthorized_to_false() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/auth/session")
            .with_status(401)
            .create_async()
            .await;
        assert!(!adapter(&server).session_valid().await.unwrap());

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/auth/session")
            .with_status(200)
            .with_body(r#"{"valid": true}"#)
            .create_async()
            .await;
        assert!(adapter(&server).session_valid().await.unwrap());
    }

    #[tokio::test]
    async fn test_field_preferences_parse() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/preferences/fields")
            .with_status(200)
            .with_body(r#"{"default_label_id": "lbl-1", "label_ids": ["lbl-1", "lbl-2"]}"#)
            .create_async()
            .await;

        let prefs = adapter(&server).field_preferences().await.unwrap();
        assert_eq!(prefs.valid_default_label(), Some("lbl-1"));
    }
}
