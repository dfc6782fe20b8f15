//! Review service: cursor-based navigation and confirmation bookkeeping
//! over detected items.

use crate::domain::{ConfirmedItem, DomainError, ItemFields, ReviewItem};
use tokio::sync::RwLock;
use tracing::debug;

/// What a skip means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipOutcome {
    /// Cursor advanced; more items to review.
    Advanced,
    /// Last item skipped with at least one confirmation; review is over.
    Complete,
    /// Skipping would end the review with zero confirmations; caller must
    /// abort the whole flow.
    NothingConfirmed,
}

#[derive(Default)]
struct ReviewState {
    items: Vec<ReviewItem>,
    cursor: usize,
    confirmed: Vec<ConfirmedItem>,
}

/// Owns the detected-item list, the review cursor, and the confirmed list.
#[derive(Default)]
pub struct ReviewService {
    state: RwLock<ReviewState>,
}

impl ReviewService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh review session over `items`. Clears prior confirmations.
    pub async fn begin(&self, items: Vec<ReviewItem>) {
        let mut st = self.state.write().await;
        st.items = items;
        st.cursor = 0;
        st.confirmed.clear();
    }

    /// The item under the cursor, if any remain.
    pub async fn current(&self) -> Option<ReviewItem> {
        let st = self.state.read().await;
        st.items.get(st.cursor).cloned()
    }

    pub async fn cursor(&self) -> usize {
        self.state.read().await.cursor
    }

    pub async fn remaining(&self) -> usize {
        let st = self.state.read().await;
        st.items.len().saturating_sub(st.cursor)
    }

    /// Replace the item under the cursor with an in-flight edit.
    pub async fn update_current(&self, item: ReviewItem) -> Result<(), DomainError> {
        let mut st = self.state.write().await;
        let cursor = st.cursor;
        match st.items.get_mut(cursor) {
            Some(slot) => {
                *slot = item;
                Ok(())
            }
            None => Err(DomainError::State("no item under review".to_string())),
        }
    }

    /// Confirm `item` (the possibly-edited current item) and advance.
    /// Returns the confirmed index and whether more items remain.
    pub async fn confirm(&self, item: ReviewItem) -> Result<(usize, bool), DomainError> {
        let mut st = self.state.write().await;
        if st.cursor >= st.items.len() {
            return Err(DomainError::State("no item under review".to_string()));
        }
        st.confirmed.push(ConfirmedItem::from_review(item));
        st.cursor += 1;
        let confirmed_index = st.confirmed.len() - 1;
        Ok((confirmed_index, st.cursor < st.items.len()))
    }

    /// Skip the current item.
    pub async fn skip(&self) -> Result<SkipOutcome, DomainError> {
        let mut st = self.state.write().await;
        if st.cursor >= st.items.len() {
            return Err(DomainError::State("no item under review".to_string()));
        }
        let last = st.cursor + 1 == st.items.len();
        if last {
            if st.confirmed.is_empty() {
                // Cursor stays put; caller resets the whole flow.
                return Ok(SkipOutcome::NothingConfirmed);
            }
            st.cursor += 1;
            return Ok(SkipOutcome::Complete);
        }
        st.cursor += 1;
        Ok(SkipOutcome::Advanced)
    }

    /// Batch-confirm from the cursor to the end, honoring an in-flight edit
    /// of the current item. Returns the first confirmed index and the count.
    pub async fn confirm_all_remaining(
        &self,
        override_current: Option<ReviewItem>,
    ) -> Result<(usize, usize), DomainError> {
        let mut st = self.state.write().await;
        if st.cursor >= st.items.len() {
            return Err(DomainError::State("no items left to confirm".to_string()));
        }
        let first_confirmed = st.confirmed.len();
        let start = st.cursor;
        let end = st.items.len();
        for i in start..end {
            let item = if i == start {
                override_current
                    .clone()
                    .unwrap_or_else(|| st.items[i].clone())
            } else {
                st.items[i].clone()
            };
            st.confirmed.push(ConfirmedItem::from_review(item));
        }
        st.cursor = end;
        debug!(confirmed = end - start, "batch-confirmed remaining items");
        Ok((first_confirmed, end - start))
    }

    /// Pull a confirmed item back into review as a single-item session,
    /// preserving all fields and compressed payloads. Deliberate: at this
    /// stage every other item has already been processed.
    pub async fn edit_confirmed(&self, index: usize) -> Result<(), DomainError> {
        let mut st = self.state.write().await;
        if index >= st.confirmed.len() {
            return Err(DomainError::State(format!(
                "confirmed index {index} out of range ({} items)",
                st.confirmed.len()
            )));
        }
        let item = st.confirmed.remove(index).into_review();
        st.items = vec![item];
        st.cursor = 0;
        Ok(())
    }

    /// Merge enrichment results into a review item, filling only fields the
    /// item does not already have. No-op when the index has left review.
    pub async fn apply_enrichment(&self, index: usize, enriched: ItemFields) {
        let mut st = self.state.write().await;
        if let Some(item) = st.items.get_mut(index) {
            item.fields.fill_missing_from(enriched);
        }
    }

    pub async fn detected_items(&self) -> Vec<ReviewItem> {
        self.state.read().await.items.clone()
    }

    pub async fn confirmed_items(&self) -> Vec<ConfirmedItem> {
        self.state.read().await.confirmed.clone()
    }

    pub async fn confirmed_count(&self) -> usize {
        self.state.read().await.confirmed.len()
    }

    pub async fn reset(&self) {
        let mut st = self.state.write().await;
        *st = ReviewState::default();
    }
}
