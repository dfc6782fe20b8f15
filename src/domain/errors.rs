//! Domain errors. Used by ports and use cases.
//!
//! Adapters map infrastructure errors into these. Cancellation is never an
//! error — it is modeled as a distinct outcome value in the services.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Vision service error: {0}")]
    Vision(String),

    #[error("Inventory service error: {0}")]
    Inventory(String),

    /// Distinct signal: aborts the whole in-flight phase, reported separately
    /// from ordinary unit failures.
    #[error("Session expired")]
    SessionExpired,

    #[error("Workflow state error: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
