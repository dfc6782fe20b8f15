//! Mock inventory adapter for testing without a store.
//!
//! Records every call for assertions and supports scripted failures,
//! session expiry, duplicate matches and field preferences.

use crate::domain::{DomainError, ItemFields};
use crate::ports::{
    AttachmentUpload, CandidateMatch, FieldPreferences, InventoryPort, MergeOutcome,
};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// One recorded create call.
#[derive(Debug, Clone)]
pub struct CreatedRecord {
    pub id: String,
    pub name: String,
    pub location_id: String,
    pub parent_id: Option<String>,
}

/// One recorded merge call.
#[derive(Debug, Clone)]
pub struct MergeRecord {
    pub target_id: String,
    pub excluded_field: String,
    pub fields: ItemFields,
}

#[derive(Default)]
struct MockInventoryState {
    created: Vec<CreatedRecord>,
    deleted: Vec<String>,
    uploads: Vec<(String, String)>,
    merges: Vec<MergeRecord>,
    fail_create: HashSet<String>,
    expire_create: HashSet<String>,
    fail_uploads: HashSet<String>,
    fail_deletes: bool,
    session_valid: bool,
    duplicates: Vec<CandidateMatch>,
    preferences: FieldPreferences,
    next_id: usize,
}

/// In-memory inventory store double.
pub struct MockInventoryAdapter {
    create_delay_ms: u64,
    state: Mutex<MockInventoryState>,
}

impl MockInventoryAdapter {
    pub fn new() -> Self {
        Self {
            create_delay_ms: 0,
            state: Mutex::new(MockInventoryState {
                session_valid: true,
                ..MockInventoryState::default()
            }),
        }
    }

    /// Simulated latency for create calls.
    pub fn with_create_delay(mut self, delay_ms: u64) -> Self {
        self.create_delay_ms = delay_ms;
        self
    }

    /// Fail item creation for items with this name.
    pub fn fail_create_on(self, name: &str) -> Self {
        self.state
            .lock()
            .expect("mock state")
            .fail_create
            .insert(name.to_string());
        self
    }

    /// Return session expiry from create for items with this name.
    pub fn expire_on_create(self, name: &str) -> Self {
        self.state
            .lock()
            .expect("mock state")
            .expire_create
            .insert(name.to_string());
        self
    }

    /// Fail attachment uploads with this file name.
    pub fn fail_upload_on(self, filename: &str) -> Self {
        self.state
            .lock()
            .expect("mock state")
            .fail_uploads
            .insert(filename.to_string());
        self
    }

    /// Make every compensating delete fail.
    pub fn fail_deletes(self) -> Self {
        self.state.lock().expect("mock state").fail_deletes = true;
        self
    }

    /// Report the session as invalid to the probe.
    pub fn with_session_invalid(self) -> Self {
        self.state.lock().expect("mock state").session_valid = false;
        self
    }

    /// Script the duplicate-check response.
    pub fn with_duplicates(self, matches: Vec<CandidateMatch>) -> Self {
        self.state.lock().expect("mock state").duplicates = matches;
        self
    }

    /// Script the field preferences.
    pub fn with_preferences(self, default_label: Option<&str>, labels: &[&str]) -> Self {
        {
            let mut st = self.state.lock().expect("mock state");
            st.preferences = FieldPreferences {
                default_label_id: default_label.map(|s| s.to_string()),
                label_ids: labels.iter().map(|s| s.to_string()).collect(),
            };
        }
        self
    }

    /// Simulate recovery: clear every scripted failure.
    pub fn clear_failures(&self) {
        let mut st = self.state.lock().expect("mock state");
        st.fail_create.clear();
        st.fail_uploads.clear();
        st.expire_create.clear();
        st.fail_deletes = false;
    }

    pub fn created(&self) -> Vec<CreatedRecord> {
        self.state.lock().expect("mock state").created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().expect("mock state").deleted.clone()
    }

    /// Successful uploads as (item id, file name) pairs.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.state.lock().expect("mock state").uploads.clone()
    }

    pub fn merges(&self) -> Vec<MergeRecord> {
        self.state.lock().expect("mock state").merges.clone()
    }
}

impl Default for MockInventoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Field names present in `fields`, for the merge outcome.
fn populated_fields(fields: &ItemFields) -> Vec<String> {
    let mut populated = vec!["name".to_string(), "quantity".to_string()];
    let optional = [
        ("description", fields.description.is_some()),
        ("manufacturer", fields.manufacturer.is_some()),
        ("model", fields.model.is_some()),
        ("serial", fields.serial.is_some()),
        ("price", fields.price.is_some()),
        ("source", fields.source.is_some()),
        ("notes", fields.notes.is_some()),
    ];
    for (name, present) in optional {
        if present {
            populated.push(name.to_string());
        }
    }
    populated
}

#[async_trait::async_trait]
impl InventoryPort for MockInventoryAdapter {
    async fn create_item(
        &self,
        fields: &ItemFields,
        location_id: &str,
        parent_id: Option<&str>,
    ) -> Result<String, DomainError> {
        if self.create_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.create_delay_ms)).await;
        }
        let mut st = self.state.lock().expect("mock state");
        if st.expire_create.contains(&fields.name) {
            return Err(DomainError::SessionExpired);
        }
        if st.fail_create.contains(&fields.name) {
            return Err(DomainError::Inventory(format!(
                "[MOCK] create failed for {}",
                fields.name
            )));
        }
        st.next_id += 1;
        let id = format!("item-{}", st.next_id);
        st.created.push(CreatedRecord {
            id: id.clone(),
            name: fields.name.clone(),
            location_id: location_id.to_string(),
            parent_id: parent_id.map(|s| s.to_string()),
        });
        info!(id = %id, name = %fields.name, "[MOCK] item created");
        Ok(id)
    }

    async fn upload_attachment(
        &self,
        item_id: &str,
        upload: &AttachmentUpload,
    ) -> Result<(), DomainError> {
        let mut st = self.state.lock().expect("mock state");
        if st.fail_uploads.contains(&upload.filename) {
            return Err(DomainError::Inventory(format!(
                "[MOCK] upload failed for {}",
                upload.filename
            )));
        }
        st.uploads
            .push((item_id.to_string(), upload.filename.clone()));
        Ok(())
    }

    async fn delete_item(&self, item_id: &str) -> Result<(), DomainError> {
        let mut st = self.state.lock().expect("mock state");
        if st.fail_deletes {
            return Err(DomainError::Inventory("[MOCK] delete failed".to_string()));
        }
        st.deleted.push(item_id.to_string());
        Ok(())
    }

    async fn merge_item(
        &self,
        target_id: &str,
        fields: &ItemFields,
        excluded_field: &str,
    ) -> Result<MergeOutcome, DomainError> {
        let mut st = self.state.lock().expect("mock state");
        st.merges.push(MergeRecord {
            target_id: target_id.to_string(),
            excluded_field: excluded_field.to_string(),
            fields: fields.clone(),
        });
        let updated: Vec<String> = populated_fields(fields)
            .into_iter()
            .filter(|f| f != excluded_field)
            .collect();
        Ok(MergeOutcome {
            updated_fields: updated,
            skipped_fields: vec![excluded_field.to_string()],
        })
    }

    async fn check_duplicates(
        &self,
        _candidates: &[ItemFields],
    ) -> Result<Vec<CandidateMatch>, DomainError> {
        Ok(self.state.lock().expect("mock state").duplicates.clone())
    }

    async fn field_preferences(&self) -> Result<FieldPreferences, DomainError> {
        Ok(self.state.lock().expect("mock state").preferences.clone())
    }

    async fn session_valid(&self) -> Result<bool, DomainError> {
        Ok(self.state.lock().expect("mock state").session_valid)
    }
}
