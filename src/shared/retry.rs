//! Bounded-retry wrapper for inventory network calls.
//!
//! Fixed attempt cap, no backoff — the HTTP layer owns backoff policy.
//! Session expiry is never retried; it aborts the caller's whole batch.

use crate::domain::DomainError;
use std::future::Future;
use tracing::warn;

/// Run `call` up to `attempts` times, returning the first success or the
/// last error. `DomainError::SessionExpired` short-circuits immediately.
pub async fn with_retry<T, F, Fut>(
    op: &str,
    attempts: usize,
    mut call: F,
) -> Result<T, DomainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(DomainError::SessionExpired) => return Err(DomainError::SessionExpired),
            Err(e) => {
                warn!(op, attempt, attempts, error = %e, "attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| DomainError::State(format!("{op}: retry exhausted"))))
}
