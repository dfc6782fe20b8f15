//! Submission service: sequential create-or-merge of confirmed items with
//! attachment upload and compensating rollback.
//!
//! Strictly one item at a time — progress stays precise and the
//! delete-on-primary-failure compensation is always scoped to its own item.

use crate::domain::{
    CapturedImage, ConfirmedItem, DomainError, ItemStatus, Progress, ReviewItem, SubmissionResult,
    UpdateDecision,
};
use crate::ports::{AttachmentUpload, InventoryPort};
use crate::shared::retry::with_retry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Aggregate counts for one submission pass, over the whole item set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionReport {
    pub success_count: usize,
    pub partial_count: usize,
    pub failed_count: usize,
    /// True when a cancel request halted the loop before the last item.
    pub halted: bool,
}

#[derive(Default)]
struct SubmissionState {
    statuses: Vec<ItemStatus>,
    photos: Vec<usize>,
    progress: Progress,
    last_result: Option<SubmissionResult>,
    cancel_requested: bool,
}

/// Submits confirmed items into the external store.
pub struct SubmissionService {
    inventory: Arc<dyn InventoryPort>,
    retry_attempts: usize,
    state: RwLock<SubmissionState>,
}

impl SubmissionService {
    pub fn new(inventory: Arc<dyn InventoryPort>, retry_attempts: usize) -> Self {
        Self {
            inventory,
            retry_attempts: retry_attempts.max(1),
            state: RwLock::new(SubmissionState::default()),
        }
    }

    /// Submit every confirmed item. The status map is fully populated before
    /// the loop begins.
    pub async fn submit(
        &self,
        items: &[ConfirmedItem],
        images: &[CapturedImage],
        location_id: &str,
        parent_id: Option<&str>,
        decisions: &HashMap<usize, UpdateDecision>,
    ) -> Result<SubmissionReport, DomainError> {
        if items.is_empty() {
            return Err(DomainError::State("no confirmed items to submit".to_string()));
        }
        self.probe_session().await?;

        {
            let mut st = self.state.write().await;
            st.statuses = vec![ItemStatus::Pending; items.len()];
            st.photos = vec![0; items.len()];
            st.progress = Progress::new(0, items.len(), "Submitting items");
            st.cancel_requested = false;
        }

        let targets: Vec<usize> = (0..items.len()).collect();
        self.process_targets(&targets, items, images, location_id, parent_id, decisions)
            .await
    }

    /// Resubmit only items currently marked failed; successes are untouched.
    pub async fn retry_failed(
        &self,
        items: &[ConfirmedItem],
        images: &[CapturedImage],
        location_id: &str,
        parent_id: Option<&str>,
        decisions: &HashMap<usize, UpdateDecision>,
    ) -> Result<SubmissionReport, DomainError> {
        let targets: Vec<usize> = {
            let st = self.state.read().await;
            if st.statuses.len() != items.len() {
                return Err(DomainError::State(
                    "no submission to retry".to_string(),
                ));
            }
            st.statuses
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == ItemStatus::Failed)
                .map(|(i, _)| i)
                .collect()
        };
        if targets.is_empty() {
            return Err(DomainError::State("no failed items to retry".to_string()));
        }
        self.probe_session().await?;

        {
            let mut st = self.state.write().await;
            for &i in &targets {
                st.statuses[i] = ItemStatus::Pending;
                st.photos[i] = 0;
            }
            st.progress = Progress::new(0, targets.len(), "Retrying failed items");
            st.cancel_requested = false;
        }

        info!(count = targets.len(), "retrying failed submissions");
        self.process_targets(&targets, items, images, location_id, parent_id, decisions)
            .await
    }

    /// Request cancellation. Sampled between items; the loop halts in place.
    pub async fn cancel(&self) {
        self.state.write().await.cancel_requested = true;
    }

    pub async fn item_statuses(&self) -> Vec<ItemStatus> {
        self.state.read().await.statuses.clone()
    }

    pub async fn progress(&self) -> Progress {
        self.state.read().await.progress.clone()
    }

    pub async fn last_result(&self) -> Option<SubmissionResult> {
        self.state.read().await.last_result.clone()
    }

    pub async fn reset(&self) {
        let mut st = self.state.write().await;
        *st = SubmissionState::default();
    }

    async fn probe_session(&self) -> Result<(), DomainError> {
        if !self.inventory.session_valid().await? {
            return Err(DomainError::SessionExpired);
        }
        Ok(())
    }

    async fn process_targets(
        &self,
        targets: &[usize],
        items: &[ConfirmedItem],
        images: &[CapturedImage],
        location_id: &str,
        parent_id: Option<&str>,
        decisions: &HashMap<usize, UpdateDecision>,
    ) -> Result<SubmissionReport, DomainError> {
        let mut halted = false;

        for (done, &index) in targets.iter().enumerate() {
            if self.state.read().await.cancel_requested {
                info!(processed = done, "submission cancelled; halting in place");
                halted = true;
                break;
            }

            let item = &items[index];
            {
                let mut st = self.state.write().await;
                st.statuses[index] = ItemStatus::Submitting;
                st.progress.current = done;
                st.progress.message = format!(
                    "Submitting item {} of {}: {}",
                    done + 1,
                    targets.len(),
                    item.item().fields.name
                );
            }

            let step = self
                .process_item(item.item(), images, location_id, parent_id, decisions.get(&index))
                .await;

            match step {
                Ok((status, photos)) => {
                    let mut st = self.state.write().await;
                    st.statuses[index] = status;
                    st.photos[index] = photos;
                    st.progress.current = done + 1;
                }
                Err(DomainError::SessionExpired) => {
                    warn!(index, "session expired mid-submission; aborting batch");
                    let mut st = self.state.write().await;
                    st.statuses[index] = ItemStatus::Failed;
                    self.finalize(items, &mut st);
                    return Err(DomainError::SessionExpired);
                }
                Err(e) => return Err(e),
            }
        }

        let mut st = self.state.write().await;
        let report = self.finalize(items, &mut st);
        Ok(SubmissionReport { halted, ..report })
    }

    /// Recompute the result summary and counts over the whole item set.
    fn finalize(&self, items: &[ConfirmedItem], st: &mut SubmissionState) -> SubmissionReport {
        let mut success = 0;
        let mut partial = 0;
        let mut failed = 0;
        let mut photo_count = 0;
        let mut label_count = 0;
        let mut names = Vec::new();

        for (i, status) in st.statuses.iter().enumerate() {
            match status {
                ItemStatus::Success => success += 1,
                ItemStatus::PartialSuccess => partial += 1,
                ItemStatus::Failed => failed += 1,
                ItemStatus::Pending | ItemStatus::Submitting => continue,
            }
            if matches!(status, ItemStatus::Success | ItemStatus::PartialSuccess) {
                photo_count += st.photos[i];
                label_count += items[i].item().fields.label_ids.len();
                names.push(items[i].item().fields.name.clone());
            }
        }

        st.progress.message = format!("{} submitted, {} failed", success + partial, failed);
        st.last_result = Some(SubmissionResult {
            item_count: success + partial,
            photo_count,
            label_count,
            item_names: names,
            finished_at: chrono::Utc::now(),
        });

        SubmissionReport {
            success_count: success,
            partial_count: partial,
            failed_count: failed,
            halted: false,
        }
    }

    /// Process one item end to end. Returns the final status and the number
    /// of photos uploaded. Only `SessionExpired` escapes as an error.
    async fn process_item(
        &self,
        item: &ReviewItem,
        images: &[CapturedImage],
        location_id: &str,
        parent_id: Option<&str>,
        decision: Option<&UpdateDecision>,
    ) -> Result<(ItemStatus, usize), DomainError> {
        match decision {
            Some(decision) => self.merge_item(item, images, decision).await,
            None => self.create_item(item, images, location_id, parent_id).await,
        }
    }

    /// Merge path: the record pre-exists, so attachment failures never delete
    /// anything — they downgrade the item to partial success.
    async fn merge_item(
        &self,
        item: &ReviewItem,
        images: &[CapturedImage],
        decision: &UpdateDecision,
    ) -> Result<(ItemStatus, usize), DomainError> {
        let attempts = self.retry_attempts;
        let outcome = with_retry("merge item", attempts, || {
            self.inventory
                .merge_item(&decision.target_id, &item.fields, &decision.matched_field)
        })
        .await;

        match outcome {
            Ok(merge) => {
                debug!(
                    target = %decision.target_id,
                    updated = merge.updated_fields.len(),
                    skipped = merge.skipped_fields.len(),
                    "item merged"
                );
            }
            Err(DomainError::SessionExpired) => return Err(DomainError::SessionExpired),
            Err(e) => {
                warn!(target = %decision.target_id, error = %e, "merge failed");
                return Ok((ItemStatus::Failed, 0));
            }
        }

        let mut photos = 0;
        let mut soft_failure = false;
        for upload in attachment_plan(item, images) {
            match with_retry("upload attachment", attempts, || {
                self.inventory.upload_attachment(&decision.target_id, &upload)
            })
            .await
            {
                Ok(()) => photos += 1,
                Err(DomainError::SessionExpired) => return Err(DomainError::SessionExpired),
                Err(e) => {
                    warn!(target = %decision.target_id, file = %upload.filename, error = %e,
                        "attachment upload failed");
                    soft_failure = true;
                }
            }
        }

        let status = if soft_failure {
            ItemStatus::PartialSuccess
        } else {
            ItemStatus::Success
        };
        Ok((status, photos))
    }

    /// Create path: a failed primary upload deletes the just-created record
    /// so the store never keeps a photo-less orphan.
    async fn create_item(
        &self,
        item: &ReviewItem,
        images: &[CapturedImage],
        location_id: &str,
        parent_id: Option<&str>,
    ) -> Result<(ItemStatus, usize), DomainError> {
        let attempts = self.retry_attempts;
        let created_id = match with_retry("create item", attempts, || {
            self.inventory.create_item(&item.fields, location_id, parent_id)
        })
        .await
        {
            Ok(id) => id,
            Err(DomainError::SessionExpired) => return Err(DomainError::SessionExpired),
            Err(e) => {
                warn!(name = %item.fields.name, error = %e, "item creation failed");
                return Ok((ItemStatus::Failed, 0));
            }
        };
        debug!(item_id = %created_id, name = %item.fields.name, "item created");

        let mut photos = 0;
        if let Some(primary) = primary_attachment(item, images) {
            match with_retry("upload primary photo", attempts, || {
                self.inventory.upload_attachment(&created_id, &primary)
            })
            .await
            {
                Ok(()) => photos += 1,
                Err(DomainError::SessionExpired) => return Err(DomainError::SessionExpired),
                Err(e) => {
                    warn!(item_id = %created_id, error = %e,
                        "primary upload failed; deleting created item");
                    // Best effort: a failed compensation is logged, never raised.
                    if let Err(del) = with_retry("delete item", attempts, || {
                        self.inventory.delete_item(&created_id)
                    })
                    .await
                    {
                        warn!(item_id = %created_id, error = %del, "compensating delete failed");
                    }
                    return Ok((ItemStatus::Failed, 0));
                }
            }
        } else {
            warn!(name = %item.fields.name, "no primary photo candidate; skipping upload");
        }

        let mut soft_failure = false;
        for upload in extra_attachments(item, images) {
            match with_retry("upload attachment", attempts, || {
                self.inventory.upload_attachment(&created_id, &upload)
            })
            .await
            {
                Ok(()) => photos += 1,
                Err(DomainError::SessionExpired) => return Err(DomainError::SessionExpired),
                Err(e) => {
                    warn!(item_id = %created_id, file = %upload.filename, error = %e,
                        "additional upload failed; keeping item");
                    soft_failure = true;
                }
            }
        }

        let status = if soft_failure {
            ItemStatus::PartialSuccess
        } else {
            ItemStatus::Success
        };
        Ok((status, photos))
    }
}

/// The single primary photo, by precedence: custom thumbnail > compressed
/// primary > original file.
fn primary_attachment(item: &ReviewItem, images: &[CapturedImage]) -> Option<AttachmentUpload> {
    if let Some(thumbnail) = &item.custom_thumbnail {
        return Some(AttachmentUpload::from_compressed(thumbnail));
    }
    if let Some(primary) = &item.compressed_primary {
        return Some(AttachmentUpload::from_compressed(primary));
    }
    images
        .get(item.source_image_index)
        .map(|img| AttachmentUpload::from_file(&img.file_path))
}

/// Additional photos: compressed variants preferred over the original
/// extra-angle files.
fn extra_attachments(item: &ReviewItem, images: &[CapturedImage]) -> Vec<AttachmentUpload> {
    if !item.compressed_extras.is_empty() {
        return item
            .compressed_extras
            .iter()
            .map(AttachmentUpload::from_compressed)
            .collect();
    }
    images
        .get(item.source_image_index)
        .map(|img| {
            img.extra_angles
                .iter()
                .map(|p| AttachmentUpload::from_file(p))
                .collect()
        })
        .unwrap_or_default()
}

/// Primary plus extras, for the merge path.
fn attachment_plan(item: &ReviewItem, images: &[CapturedImage]) -> Vec<AttachmentUpload> {
    let mut plan = Vec::new();
    if let Some(primary) = primary_attachment(item, images) {
        plan.push(primary);
    }
    plan.extend(extra_attachments(item, images));
    plan
}
