//! Domain entities. Pure data structures for the core business.
//!
//! No HTTP/IO types here — these are mapped from adapters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A photo of one or more physical items, plus per-image analysis options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedImage {
    pub file_path: PathBuf,
    /// Opaque preview handle for the UI layer (e.g. an object URL).
    pub preview: Option<String>,
    /// Ask the vision service to split the photo into separate items.
    pub separate_items: bool,
    /// Free-text instructions forwarded to the vision service.
    pub instructions: Option<String>,
    /// Additional angle shots of the same item(s).
    pub extra_angles: Vec<PathBuf>,
}

impl CapturedImage {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            preview: None,
            separate_items: false,
            instructions: None,
            extra_angles: Vec::new(),
        }
    }

    /// File name without directory, for logs and upload part names.
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string())
    }
}

/// Item metadata as detected by the vision service and consumed by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemFields {
    pub name: String,
    pub quantity: u32,
    pub description: Option<String>,
    pub label_ids: Vec<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub price: Option<f64>,
    pub source: Option<String>,
    pub notes: Option<String>,
}

impl ItemFields {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quantity: 1,
            ..Self::default()
        }
    }

    /// True when the item carries a signal usable for duplicate matching.
    pub fn has_identifying_fields(&self) -> bool {
        self.serial.is_some()
            || (self.manufacturer.is_some() && self.model.is_some())
            || !self.name.trim().is_empty()
    }

    /// Fill empty fields from `other`; never clobber existing data. Used by
    /// AI enrichment so user edits always win.
    pub fn fill_missing_from(&mut self, other: ItemFields) {
        if self.description.is_none() {
            self.description = other.description;
        }
        if self.manufacturer.is_none() {
            self.manufacturer = other.manufacturer;
        }
        if self.model.is_none() {
            self.model = other.model;
        }
        if self.serial.is_none() {
            self.serial = other.serial;
        }
        if self.price.is_none() {
            self.price = other.price;
        }
        if self.source.is_none() {
            self.source = other.source;
        }
        if self.notes.is_none() {
            self.notes = other.notes;
        }
    }
}

/// Compressed image payload returned by the vision service or rendered by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedImage {
    pub filename: String,
    pub mime: String,
    pub data: Vec<u8>,
}

/// A detected item under review. Mutated freely until confirmed or skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub fields: ItemFields,
    /// Non-owning back-reference into the current image list. Re-derived
    /// whenever images are removed.
    pub source_image_index: usize,
    pub compressed_primary: Option<CompressedImage>,
    pub compressed_extras: Vec<CompressedImage>,
    /// Rendered result of the user's thumbnail edit, if any. Takes precedence
    /// over every other primary-photo candidate at submission.
    pub custom_thumbnail: Option<CompressedImage>,
}

impl ReviewItem {
    pub fn new(fields: ItemFields, source_image_index: usize) -> Self {
        Self {
            fields,
            source_image_index,
            compressed_primary: None,
            compressed_extras: Vec::new(),
            custom_thumbnail: None,
        }
    }
}

/// An item the user explicitly confirmed. Immutable; the only way back into
/// review is [`ConfirmedItem::into_review`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedItem {
    item: ReviewItem,
}

impl ConfirmedItem {
    pub fn from_review(item: ReviewItem) -> Self {
        Self { item }
    }

    pub fn item(&self) -> &ReviewItem {
        &self.item
    }

    /// Reconstitute as a review item, preserving all fields and payloads.
    pub fn into_review(self) -> ReviewItem {
        self.item
    }
}

/// One group of images in grouped-analysis mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGroup {
    pub id: String,
    pub item: Option<ReviewItem>,
    pub image_indices: Vec<usize>,
}

impl ImageGroup {
    /// Groups that cover several images, or detected nothing, need the user
    /// to confirm the grouping before review starts.
    pub fn needs_review(&self) -> bool {
        self.image_indices.len() > 1 || self.item.is_none()
    }
}

/// How an existing store item was matched against a detected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Serial,
    ManufacturerModel,
    FuzzyName,
}

impl MatchType {
    /// The field that triggered the match. Excluded from a merge payload so
    /// the merge cannot erase the signal that identified the duplicate.
    pub fn matched_field(&self) -> &'static str {
        match self {
            MatchType::Serial => "serial",
            MatchType::ManufacturerModel => "model",
            MatchType::FuzzyName => "name",
        }
    }
}

/// A detected item matched against an existing item in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateMatch {
    /// Position in the detected (later: confirmed) item array, never an
    /// external id.
    pub item_index: usize,
    pub existing_id: String,
    pub existing_name: String,
    pub match_type: MatchType,
    pub confidence: f32,
    pub similarity: f32,
}

/// Per-item choice to merge into an existing store item instead of creating
/// a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDecision {
    pub item_index: usize,
    pub target_id: String,
    pub target_name: String,
    /// Excluded from the merge payload.
    pub matched_field: String,
}

impl UpdateDecision {
    pub fn from_match(m: &DuplicateMatch) -> Self {
        Self {
            item_index: m.item_index,
            target_id: m.existing_id.clone(),
            target_name: m.existing_name.clone(),
            matched_field: m.match_type.matched_field().to_string(),
        }
    }
}

/// Summary of a completed submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub item_count: usize,
    pub photo_count: usize,
    pub label_count: usize,
    pub item_names: Vec<String>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

/// Progress of a batch. Shared shape for analysis and submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

impl Progress {
    pub fn new(current: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
        }
    }
}

/// Per-image analysis status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Analyzing,
    Success,
    Failed,
}

/// Per-item submission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Submitting,
    Success,
    PartialSuccess,
    Failed,
}

/// Workflow phase. Exactly one is active at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    #[default]
    Idle,
    Location,
    Capturing,
    Analyzing,
    PartialAnalysis,
    Grouping,
    Reviewing,
    Confirming,
    Submitting,
    Complete,
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowPhase::Idle => "idle",
            WorkflowPhase::Location => "location",
            WorkflowPhase::Capturing => "capturing",
            WorkflowPhase::Analyzing => "analyzing",
            WorkflowPhase::PartialAnalysis => "partial_analysis",
            WorkflowPhase::Grouping => "grouping",
            WorkflowPhase::Reviewing => "reviewing",
            WorkflowPhase::Confirming => "confirming",
            WorkflowPhase::Submitting => "submitting",
            WorkflowPhase::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Token usage reported by the vision service. Accumulated per analysis run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matched_field_per_match_type() {
        assert_eq!(MatchType::Serial.matched_field(), "serial");
        assert_eq!(MatchType::ManufacturerModel.matched_field(), "model");
        assert_eq!(MatchType::FuzzyName.matched_field(), "name");
    }

    #[test]
    fn test_identifying_fields() {
        let mut fields = ItemFields::default();
        assert!(!fields.has_identifying_fields());

        fields.name = "Drill".to_string();
        assert!(fields.has_identifying_fields());

        let serial_only = ItemFields {
            serial: Some("SN-1".to_string()),
            ..ItemFields::default()
        };
        assert!(serial_only.has_identifying_fields());
    }

    #[test]
    fn test_confirmed_item_round_trip_preserves_payloads() {
        let mut item = ReviewItem::new(ItemFields::named("Lamp"), 2);
        item.compressed_primary = Some(CompressedImage {
            filename: "lamp.webp".to_string(),
            mime: "image/webp".to_string(),
            data: vec![1, 2, 3],
        });

        let confirmed = ConfirmedItem::from_review(item.clone());
        let back = confirmed.into_review();
        assert_eq!(back, item);
    }

    #[test]
    fn test_group_needs_review() {
        let item = ReviewItem::new(ItemFields::named("Chair"), 0);
        let single = ImageGroup {
            id: "group-1".to_string(),
            item: Some(item.clone()),
            image_indices: vec![0],
        };
        assert!(!single.needs_review());

        let multi = ImageGroup {
            id: "group-2".to_string(),
            item: Some(item),
            image_indices: vec![1, 2],
        };
        assert!(multi.needs_review());

        let empty = ImageGroup {
            id: "group-3".to_string(),
            item: None,
            image_indices: vec![3],
        };
        assert!(empty.needs_review());
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&WorkflowPhase::PartialAnalysis).unwrap();
        assert_eq!(json, "\"partial_analysis\"");
        assert_eq!(WorkflowPhase::PartialAnalysis.to_string(), "partial_analysis");
    }

    #[test]
    fn test_update_decision_from_match() {
        let m = DuplicateMatch {
            item_index: 3,
            existing_id: "itm-9".to_string(),
            existing_name: "Old drill".to_string(),
            match_type: MatchType::Serial,
            confidence: 0.97,
            similarity: 1.0,
        };
        let d = UpdateDecision::from_match(&m);
        assert_eq!(d.item_index, 3);
        assert_eq!(d.target_id, "itm-9");
        assert_eq!(d.matched_field, "serial");
    }
}
