//! Port traits. API boundaries for the hexagon.
//!
//! The UI layer drives the workflow coordinator directly; everything the
//! application calls out to lives behind these outbound traits.

pub mod outbound;

pub use outbound::{
    AttachmentPayload, AttachmentUpload, CandidateMatch, DetectedGroup, Detection,
    FieldPreferences, InventoryPort, MergeOutcome, VisionPort,
};
