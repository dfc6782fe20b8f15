//! HTTP vision adapter. Implements VisionPort against the detection service.
//!
//! Images are shipped base64-encoded; responses carry detected items,
//! compressed photo variants and token usage. Every call races the shared
//! cancellation token so an abort returns promptly.

use crate::domain::{CapturedImage, CompressedImage, DomainError, ItemFields, TokenUsage};
use crate::ports::{DetectedGroup, Detection, VisionPort};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Detection can be slow; give the endpoint ample time.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Vision detection API client.
pub struct HttpVisionAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct EncodedImage {
    filename: String,
    data: String,
}

#[derive(Serialize)]
struct DetectRequest {
    image: EncodedImage,
    separate_items: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    extra_images: Vec<EncodedImage>,
}

#[derive(Serialize)]
struct GroupRequest {
    images: Vec<EncodedImage>,
}

#[derive(Serialize)]
struct EnrichRequest<'a> {
    item: &'a ItemFields,
}

#[derive(Deserialize)]
struct WireCompressed {
    filename: String,
    mime: String,
    data: String,
}

#[derive(Deserialize)]
struct WireTokenUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct DetectResponse {
    items: Vec<ItemFields>,
    #[serde(default)]
    compressed_images: Vec<WireCompressed>,
    token_usage: Option<WireTokenUsage>,
}

#[derive(Deserialize)]
struct WireGroup {
    item: Option<ItemFields>,
    image_indices: Vec<usize>,
}

#[derive(Deserialize)]
struct GroupResponse {
    groups: Vec<WireGroup>,
}

#[derive(Deserialize)]
struct EnrichResponse {
    item: ItemFields,
}

impl HttpVisionAdapter {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url,
            api_key,
        }
    }

    async fn encode_image(path: &Path) -> Result<EncodedImage, DomainError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| DomainError::Vision(format!("read {}: {e}", path.display())))?;
        Ok(EncodedImage {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string()),
            data: BASE64.encode(bytes),
        })
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp, DomainError> {
        let url = format!("{}/{endpoint}", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| DomainError::Vision(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %text, "vision API returned error");
            return Err(DomainError::Vision(format!(
                "API error {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| DomainError::Vision(format!("failed to parse API response: {e}")))
    }
}

fn decode_compressed(wire: Vec<WireCompressed>) -> Result<Vec<CompressedImage>, DomainError> {
    wire.into_iter()
        .map(|c| {
            Ok(CompressedImage {
                data: BASE64
                    .decode(&c.data)
                    .map_err(|e| DomainError::Vision(format!("bad compressed payload: {e}")))?,
                filename: c.filename,
                mime: c.mime,
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl VisionPort for HttpVisionAdapter {
    async fn detect_items(
        &self,
        image: &CapturedImage,
        cancel: &CancellationToken,
    ) -> Result<Detection, DomainError> {
        let mut extra_images = Vec::with_capacity(image.extra_angles.len());
        for path in &image.extra_angles {
            extra_images.push(Self::encode_image(path).await?);
        }
        let request = DetectRequest {
            image: Self::encode_image(&image.file_path).await?,
            separate_items: image.separate_items,
            instructions: image.instructions.clone(),
            extra_images,
        };

        debug!(image = %image.file_name(), "sending detection request");
        let response: DetectResponse = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DomainError::Vision("detection cancelled".to_string()));
            }
            res = self.post_json("v1/detect", &request) => res?,
        };

        info!(
            image = %image.file_name(),
            items = response.items.len(),
            "detection complete"
        );
        Ok(Detection {
            items: response.items,
            compressed: decode_compressed(response.compressed_images)?,
            token_usage: response.token_usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
        })
    }

    async fn detect_grouped(
        &self,
        images: &[CapturedImage],
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectedGroup>, DomainError> {
        let mut encoded = Vec::with_capacity(images.len());
        for image in images {
            encoded.push(Self::encode_image(&image.file_path).await?);
        }
        let request = GroupRequest { images: encoded };

        let response: GroupResponse = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DomainError::Vision("detection cancelled".to_string()));
            }
            res = self.post_json("v1/detect-group", &request) => res?,
        };

        info!(groups = response.groups.len(), "grouped detection complete");
        Ok(response
            .groups
            .into_iter()
            .map(|g| DetectedGroup {
                item: g.item,
                image_indices: g.image_indices,
            })
            .collect())
    }

    async fn enrich_fields(&self, fields: &ItemFields) -> Result<ItemFields, DomainError> {
        let response: EnrichResponse = self
            .post_json("v1/enrich", &EnrichRequest { item: fields })
            .await?;
        Ok(response.item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_image(dir: &tempfile::TempDir, name: &str) -> CapturedImage {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"fake jpeg bytes").unwrap();
        CapturedImage::new(path)
    }

    #[tokio::test]
    async fn test_detect_parses_items_and_compressed() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "items": [
                {"name": "Drill", "quantity": 1, "serial": "SN-1"}
            ],
            "compressed_images": [
                {"filename": "drill.webp", "mime": "image/webp", "data": BASE64.encode(b"webp")}
            ],
            "token_usage": {"prompt_tokens": 900, "completion_tokens": 120}
        });
        let mock = server
            .mock("POST", "/v1/detect")
            .match_header("authorization", "Bearer key-1")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let adapter = HttpVisionAdapter::new(server.url(), "key-1".to_string());
        let detection = adapter
            .detect_items(&test_image(&dir, "drill.jpg"), &CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(detection.items.len(), 1);
        assert_eq!(detection.items[0].name, "Drill");
        assert_eq!(detection.items[0].serial.as_deref(), Some("SN-1"));
        assert_eq!(detection.compressed[0].data, b"webp");
        assert_eq!(detection.token_usage.unwrap().prompt_tokens, 900);
    }

    #[tokio::test]
    async fn test_detect_maps_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/detect")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let adapter = HttpVisionAdapter::new(server.url(), "key-1".to_string());
        let result = adapter
            .detect_items(&test_image(&dir, "a.jpg"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DomainError::Vision(_))));
    }

    #[tokio::test]
    async fn test_detect_grouped_parses_groups() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "groups": [
                {"item": {"name": "Desk"}, "image_indices": [0, 1]},
                {"item": null, "image_indices": [2]}
            ]
        });
        server
            .mock("POST", "/v1/detect-group")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let images = vec![
            test_image(&dir, "a.jpg"),
            test_image(&dir, "b.jpg"),
            test_image(&dir, "c.jpg"),
        ];
        let adapter = HttpVisionAdapter::new(server.url(), "key-1".to_string());
        let groups = adapter
            .detect_grouped(&images, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].image_indices, vec![0, 1]);
        assert!(groups[1].item.is_none());
    }

    #[tokio::test]
    async fn test_enrich_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "item": {"name": "Drill", "description": "18V cordless drill"}
        });
        server
            .mock("POST", "/v1/enrich")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let adapter = HttpVisionAdapter::new(server.url(), "key-1".to_string());
        let enriched = adapter
            .enrich_fields(&ItemFields::named("Drill"))
            .await
            .unwrap();
        assert_eq!(enriched.description.as_deref(), Some("18V cordless drill"));
    }
}
