//! Core domain layer. No external I/O dependencies.
//!
//! Entities and business rules live here. Dependencies flow inward.

pub mod entities;
pub mod errors;

pub use entities::{
    CapturedImage, CompressedImage, ConfirmedItem, DuplicateMatch, ImageGroup, ImageStatus,
    ItemFields, ItemStatus, MatchType, Progress, ReviewItem, SubmissionResult, TokenUsage,
    UpdateDecision, WorkflowPhase,
};
pub use errors::DomainError;
