//! Outbound ports. Application calls into infrastructure.
//!
//! Implemented by adapters.

use crate::domain::{
    CapturedImage, CompressedImage, DomainError, ItemFields, MatchType, TokenUsage,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Result of a single-image detection call.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub items: Vec<ItemFields>,
    /// Compressed variants of the analyzed photo. First one is the primary,
    /// the rest are additional variants.
    pub compressed: Vec<CompressedImage>,
    pub token_usage: Option<TokenUsage>,
}

/// One group returned by the grouped-detection endpoint.
#[derive(Debug, Clone)]
pub struct DetectedGroup {
    pub item: Option<ItemFields>,
    pub image_indices: Vec<usize>,
}

/// AI vision gateway. Detects item metadata from photos.
#[async_trait::async_trait]
pub trait VisionPort: Send + Sync {
    /// Analyze one image (plus its extra angles). The cancellation token is
    /// threaded into the network call; a cancelled call returns promptly and
    /// the caller decides whether the outcome is a cancel or a failure.
    async fn detect_items(
        &self,
        image: &CapturedImage,
        cancel: &CancellationToken,
    ) -> Result<Detection, DomainError>;

    /// Analyze several images at once, grouping shots of the same item.
    async fn detect_grouped(
        &self,
        images: &[CapturedImage],
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectedGroup>, DomainError>;

    /// Fill in missing metadata for one detected item.
    async fn enrich_fields(&self, fields: &ItemFields) -> Result<ItemFields, DomainError>;
}

/// Attachment payload: in-memory bytes (compressed variants, thumbnails) or
/// a file on disk (originals).
#[derive(Debug, Clone)]
pub enum AttachmentPayload {
    Bytes { data: Vec<u8>, mime: String },
    File(PathBuf),
}

/// One attachment to upload for an item.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub payload: AttachmentPayload,
}

impl AttachmentUpload {
    pub fn from_compressed(image: &CompressedImage) -> Self {
        Self {
            filename: image.filename.clone(),
            payload: AttachmentPayload::Bytes {
                data: image.data.clone(),
                mime: image.mime.clone(),
            },
        }
    }

    pub fn from_file(path: &std::path::Path) -> Self {
        Self {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "photo".to_string()),
            payload: AttachmentPayload::File(path.to_path_buf()),
        }
    }
}

/// Outcome of a merge: which fields the store accepted and which it skipped.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub updated_fields: Vec<String>,
    pub skipped_fields: Vec<String>,
}

/// A duplicate-check hit. `candidate_index` is the position in the submitted
/// candidate slice; the caller remaps it to its own item indices.
#[derive(Debug, Clone)]
pub struct CandidateMatch {
    pub candidate_index: usize,
    pub existing_id: String,
    pub existing_name: String,
    pub match_type: MatchType,
    pub confidence: f32,
    pub similarity: f32,
}

/// Field preferences, fetched once per session and cached.
#[derive(Debug, Clone, Default)]
pub struct FieldPreferences {
    pub default_label_id: Option<String>,
    pub label_ids: Vec<String>,
}

impl FieldPreferences {
    /// The default label, but only while it still exists in the label set.
    pub fn valid_default_label(&self) -> Option<&str> {
        self.default_label_id
            .as_deref()
            .filter(|id| self.label_ids.iter().any(|l| l == id))
    }
}

/// External inventory store gateway.
#[async_trait::async_trait]
pub trait InventoryPort: Send + Sync {
    /// Create a new item. Returns the created item id.
    async fn create_item(
        &self,
        fields: &ItemFields,
        location_id: &str,
        parent_id: Option<&str>,
    ) -> Result<String, DomainError>;

    /// Upload one attachment for an item.
    async fn upload_attachment(
        &self,
        item_id: &str,
        upload: &AttachmentUpload,
    ) -> Result<(), DomainError>;

    /// Delete an item. Used only as compensation for a failed primary upload.
    async fn delete_item(&self, item_id: &str) -> Result<(), DomainError>;

    /// Merge fields into an existing item, leaving `excluded_field` untouched.
    async fn merge_item(
        &self,
        target_id: &str,
        fields: &ItemFields,
        excluded_field: &str,
    ) -> Result<MergeOutcome, DomainError>;

    /// Bulk duplicate check for candidate items.
    async fn check_duplicates(
        &self,
        candidates: &[ItemFields],
    ) -> Result<Vec<CandidateMatch>, DomainError>;

    /// Field preferences (default label and the known label set).
    async fn field_preferences(&self) -> Result<FieldPreferences, DomainError>;

    /// Session-validity probe, consulted before submission.
    async fn session_valid(&self) -> Result<bool, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_default_label() {
        let prefs = FieldPreferences {
            default_label_id: Some("lbl-1".to_string()),
            label_ids: vec!["lbl-1".to_string(), "lbl-2".to_string()],
        };
        assert_eq!(prefs.valid_default_label(), Some("lbl-1"));

        let stale = FieldPreferences {
            default_label_id: Some("lbl-9".to_string()),
            label_ids: vec!["lbl-1".to_string()],
        };
        assert_eq!(stale.valid_default_label(), None);
    }

    #[test]
    fn test_attachment_from_file_name() {
        let upload = AttachmentUpload::from_file(std::path::Path::new("/photos/shelf.jpg"));
        assert_eq!(upload.filename, "shelf.jpg");
        assert!(matches!(upload.payload, AttachmentPayload::File(_)));
    }
}
