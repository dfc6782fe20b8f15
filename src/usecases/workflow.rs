//! Workflow coordinator: owns the phase machine, wires the four services,
//! and exposes the unified read/write state surface to the UI layer.
//!
//! Each service mutates only its own state; the coordinator reads through
//! accessors and reports back into services through their methods — a
//! single-writer-per-collection rule, no cross-service locking.

use crate::domain::{
    CapturedImage, ConfirmedItem, DomainError, DuplicateMatch, ImageGroup, ImageStatus,
    ItemFields, ItemStatus, Progress, ReviewItem, SubmissionResult, TokenUsage, UpdateDecision,
    WorkflowPhase,
};
use crate::ports::{InventoryPort, VisionPort};
use crate::shared::config::AppConfig;
use crate::usecases::analysis_service::{AnalysisOutcome, AnalysisService, GroupedOutcome};
use crate::usecases::capture_service::CaptureService;
use crate::usecases::review_service::{ReviewService, SkipOutcome};
use crate::usecases::submission_service::{SubmissionReport, SubmissionService};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Default)]
struct WorkflowState {
    phase: WorkflowPhase,
    location_id: Option<String>,
    parent_id: Option<String>,
    error: Option<String>,
    duplicate_matches: Vec<DuplicateMatch>,
    update_decisions: HashMap<usize, UpdateDecision>,
    /// Detected index -> confirmed index, built during review.
    confirmed_map: HashMap<usize, usize>,
    /// Set once review ends; duplicate matches are in confirmed-index space
    /// from then on.
    review_finished: bool,
}

/// The scan-to-submit coordinator. Drives capture, analysis, review and
/// submission, and owns the phase machine.
pub struct ScanWorkflow {
    capture: Arc<CaptureService>,
    analysis: Arc<AnalysisService>,
    review: Arc<ReviewService>,
    submission: Arc<SubmissionService>,
    vision: Arc<dyn VisionPort>,
    inventory: Arc<dyn InventoryPort>,
    auto_enrich: bool,
    state: Arc<RwLock<WorkflowState>>,
}

impl ScanWorkflow {
    pub fn new(
        vision: Arc<dyn VisionPort>,
        inventory: Arc<dyn InventoryPort>,
        cfg: &AppConfig,
    ) -> Self {
        let analysis = Arc::new(AnalysisService::new(
            Arc::clone(&vision),
            Arc::clone(&inventory),
            cfg.analysis_workers_or_default(),
        ));
        let submission = Arc::new(SubmissionService::new(
            Arc::clone(&inventory),
            cfg.retry_attempts_or_default(),
        ));
        Self {
            capture: Arc::new(CaptureService::new()),
            analysis,
            review: Arc::new(ReviewService::new()),
            submission,
            vision,
            inventory,
            auto_enrich: cfg.auto_enrich_or_default(),
            state: Arc::new(RwLock::new(WorkflowState::default())),
        }
    }

    // ── Transitions ────────────────────────────────────────────────────────

    /// Leave idle and start choosing a location.
    pub async fn begin(&self) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Idle], "begin").await?;
        self.state.write().await.phase = WorkflowPhase::Location;
        Ok(())
    }

    /// Choose the target location (and optional parent item); moves to
    /// capturing.
    pub async fn select_location(
        &self,
        location_id: impl Into<String>,
        parent_id: Option<String>,
    ) -> Result<(), DomainError> {
        self.require_phase(
            &[WorkflowPhase::Location, WorkflowPhase::Capturing],
            "select location",
        )
        .await?;
        let mut st = self.state.write().await;
        st.location_id = Some(location_id.into());
        st.parent_id = parent_id;
        st.phase = WorkflowPhase::Capturing;
        Ok(())
    }

    pub async fn add_image(&self, image: CapturedImage) -> Result<usize, DomainError> {
        self.require_phase(&[WorkflowPhase::Capturing], "add image")
            .await?;
        Ok(self.capture.add(image).await)
    }

    pub async fn remove_image(&self, index: usize) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Capturing], "remove image")
            .await?;
        self.capture.remove(index).await.map(|_| ())
    }

    pub async fn update_image_options(
        &self,
        index: usize,
        separate_items: bool,
        instructions: Option<String>,
    ) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Capturing], "update image options")
            .await?;
        self.capture
            .update_options(index, separate_items, instructions)
            .await
    }

    pub async fn add_extra_angle(&self, index: usize, path: PathBuf) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Capturing], "add extra angle")
            .await?;
        self.capture.add_extra_angle(index, path).await
    }

    pub async fn remove_extra_angle(
        &self,
        index: usize,
        angle_index: usize,
    ) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Capturing], "remove extra angle")
            .await?;
        self.capture.remove_extra_angle(index, angle_index).await
    }

    /// Run analysis over the captured images. Routes to reviewing,
    /// partial-analysis or back to capturing; analysis failures become the
    /// workflow error banner, not an `Err`.
    pub async fn start_analysis(&self, grouped: bool) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Capturing], "start analysis")
            .await?;
        let images = self.capture.images().await;
        if images.is_empty() {
            return Err(DomainError::State("no images captured".to_string()));
        }

        {
            let mut st = self.state.write().await;
            st.phase = WorkflowPhase::Analyzing;
            st.error = None;
            st.duplicate_matches.clear();
            st.update_decisions.clear();
            st.confirmed_map.clear();
            st.review_finished = false;
        }

        if grouped {
            let result = self.analysis.run_grouped(images).await;
            self.route_grouped_analysis(result).await;
        } else {
            let result = self.analysis.run(images).await;
            self.route_analysis(result).await;
        }
        Ok(())
    }

    /// Cancel the in-flight analysis. The awaiting `start_analysis` (or
    /// retry) call performs the routing.
    pub async fn cancel_analysis(&self) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Analyzing], "cancel analysis")
            .await?;
        self.analysis.cancel().await;
        Ok(())
    }

    /// Re-run detection for the failed subset only.
    pub async fn retry_failed_analysis(&self) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::PartialAnalysis], "retry analysis")
            .await?;
        let images = self.capture.images().await;
        {
            let mut st = self.state.write().await;
            st.phase = WorkflowPhase::Analyzing;
            st.error = None;
        }
        let result = self.analysis.retry_failed(images).await;
        self.route_analysis(result).await;
        Ok(())
    }

    /// Keep only the successful detections and start reviewing them.
    pub async fn continue_with_successful(&self) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::PartialAnalysis], "continue")
            .await?;
        self.enter_review().await;
        Ok(())
    }

    /// Drop the failed images, re-index the surviving items, and review.
    pub async fn remove_failed_images(&self) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::PartialAnalysis], "remove failed images")
            .await?;
        let removed = self.analysis.remove_failed_images().await;
        self.capture.remove_many(&removed).await;
        self.enter_review().await;
        Ok(())
    }

    /// Accept the (possibly user-adjusted) grouping and start reviewing.
    pub async fn confirm_grouping(&self, groups: Vec<ImageGroup>) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Grouping], "confirm grouping")
            .await?;
        let items = self.analysis.apply_grouping(groups).await;
        if items.is_empty() {
            return Err(DomainError::State(
                "grouping produced no items".to_string(),
            ));
        }
        self.enter_review().await;
        Ok(())
    }

    /// Replace the item under the cursor with an in-flight edit.
    pub async fn update_current_item(&self, item: ReviewItem) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Reviewing], "edit item")
            .await?;
        self.review.update_current(item).await
    }

    /// Confirm the current (possibly edited) item and advance.
    pub async fn confirm_current(&self, item: ReviewItem) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Reviewing], "confirm item")
            .await?;
        let detected_index = self.review.cursor().await;
        let (confirmed_index, more) = self.review.confirm(item).await?;
        self.state
            .write()
            .await
            .confirmed_map
            .insert(detected_index, confirmed_index);
        if !more {
            self.finish_review().await;
        }
        Ok(())
    }

    /// Skip the current item. Skipping everything resets the whole workflow.
    pub async fn skip_current(&self) -> Result<SkipOutcome, DomainError> {
        self.require_phase(&[WorkflowPhase::Reviewing], "skip item")
            .await?;
        let outcome = self.review.skip().await?;
        match outcome {
            SkipOutcome::Advanced => {}
            SkipOutcome::Complete => self.finish_review().await,
            SkipOutcome::NothingConfirmed => {
                info!("nothing confirmed; resetting workflow");
                self.reset().await;
            }
        }
        Ok(outcome)
    }

    /// Batch-confirm everything from the cursor on.
    pub async fn confirm_all_remaining(
        &self,
        override_current: Option<ReviewItem>,
    ) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Reviewing], "confirm remaining")
            .await?;
        let start_detected = self.review.cursor().await;
        let (first_confirmed, count) = self.review.confirm_all_remaining(override_current).await?;
        {
            let mut st = self.state.write().await;
            for k in 0..count {
                st.confirmed_map.insert(start_detected + k, first_confirmed + k);
            }
        }
        self.finish_review().await;
        Ok(())
    }

    /// Pull one confirmed item back into a single-item review session.
    pub async fn edit_confirmed(&self, index: usize) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Confirming], "edit confirmed item")
            .await?;
        self.review.edit_confirmed(index).await?;

        let mut st = self.state.write().await;
        // Later confirmed indices shift down past the removed slot; the
        // edited item's own match and decision are dropped.
        st.update_decisions = st
            .update_decisions
            .drain()
            .filter_map(|(i, mut d)| match i.cmp(&index) {
                std::cmp::Ordering::Less => Some((i, d)),
                std::cmp::Ordering::Equal => None,
                std::cmp::Ordering::Greater => {
                    d.item_index = i - 1;
                    Some((i - 1, d))
                }
            })
            .collect();
        let mut matches = std::mem::take(&mut st.duplicate_matches);
        matches.retain(|m| m.item_index != index);
        for m in matches.iter_mut() {
            if m.item_index > index {
                m.item_index -= 1;
            }
        }
        st.duplicate_matches = matches;
        st.phase = WorkflowPhase::Reviewing;
        Ok(())
    }

    /// Merge this item into the matched existing record instead of creating
    /// a new one.
    pub async fn mark_for_update(&self, m: &DuplicateMatch) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Confirming], "mark for update")
            .await?;
        let confirmed = self.review.confirmed_count().await;
        if m.item_index >= confirmed {
            return Err(DomainError::State(format!(
                "item index {} out of range ({confirmed} confirmed items)",
                m.item_index
            )));
        }
        self.state
            .write()
            .await
            .update_decisions
            .insert(m.item_index, UpdateDecision::from_match(m));
        Ok(())
    }

    /// Revert to creating a new record for this item.
    pub async fn mark_for_create(&self, item_index: usize) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Confirming], "mark for create")
            .await?;
        self.state.write().await.update_decisions.remove(&item_index);
        Ok(())
    }

    /// Submit all confirmed items. Routes to complete, stays in submitting
    /// for targeted retry, or falls back to confirming.
    pub async fn submit(&self) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Confirming], "submit")
            .await?;
        let (location_id, parent_id, decisions) = {
            let st = self.state.read().await;
            let location = st
                .location_id
                .clone()
                .ok_or_else(|| DomainError::State("no location selected".to_string()))?;
            (location, st.parent_id.clone(), st.update_decisions.clone())
        };

        {
            let mut st = self.state.write().await;
            st.phase = WorkflowPhase::Submitting;
            st.error = None;
        }

        let items = self.review.confirmed_items().await;
        let images = self.capture.images().await;
        let result = self
            .submission
            .submit(&items, &images, &location_id, parent_id.as_deref(), &decisions)
            .await;
        self.route_submission(result).await;
        Ok(())
    }

    /// Resubmit only items currently marked failed.
    pub async fn retry_failed_submission(&self) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Submitting], "retry submission")
            .await?;
        let (location_id, parent_id, decisions) = {
            let st = self.state.read().await;
            let location = st
                .location_id
                .clone()
                .ok_or_else(|| DomainError::State("no location selected".to_string()))?;
            (location, st.parent_id.clone(), st.update_decisions.clone())
        };

        let items = self.review.confirmed_items().await;
        let images = self.capture.images().await;
        let result = self
            .submission
            .retry_failed(&items, &images, &location_id, parent_id.as_deref(), &decisions)
            .await;
        self.route_submission(result).await;
        Ok(())
    }

    /// Cancel the in-flight submission; the loop halts between items.
    pub async fn cancel_submission(&self) -> Result<(), DomainError> {
        self.require_phase(&[WorkflowPhase::Submitting], "cancel submission")
            .await?;
        self.submission.cancel().await;
        Ok(())
    }

    /// Full reset: clears every service and returns to idle.
    pub async fn reset(&self) {
        self.capture.clear().await;
        self.analysis.reset().await;
        self.review.reset().await;
        self.submission.reset().await;
        let mut st = self.state.write().await;
        *st = WorkflowState::default();
    }

    // ── Read surface ───────────────────────────────────────────────────────

    pub async fn phase(&self) -> WorkflowPhase {
        self.state.read().await.phase
    }

    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    pub async fn location(&self) -> Option<String> {
        self.state.read().await.location_id.clone()
    }

    pub async fn parent_item(&self) -> Option<String> {
        self.state.read().await.parent_id.clone()
    }

    pub async fn images(&self) -> Vec<CapturedImage> {
        self.capture.images().await
    }

    pub async fn image_statuses(&self) -> Vec<ImageStatus> {
        self.analysis.statuses().await
    }

    pub async fn analysis_progress(&self) -> Progress {
        self.analysis.progress().await
    }

    pub async fn analysis_errors(&self) -> HashMap<usize, String> {
        self.analysis.unit_errors().await
    }

    pub async fn analysis_failed_count(&self) -> usize {
        self.analysis.failed_count().await
    }

    pub async fn token_usage(&self) -> TokenUsage {
        self.analysis.token_usage().await
    }

    pub async fn groups(&self) -> Vec<ImageGroup> {
        self.analysis.groups().await
    }

    pub async fn detected_items(&self) -> Vec<ReviewItem> {
        self.review.detected_items().await
    }

    pub async fn current_item(&self) -> Option<ReviewItem> {
        self.review.current().await
    }

    pub async fn confirmed_items(&self) -> Vec<ConfirmedItem> {
        self.review.confirmed_items().await
    }

    pub async fn duplicate_matches(&self) -> Vec<DuplicateMatch> {
        self.state.read().await.duplicate_matches.clone()
    }

    pub async fn update_decisions(&self) -> Vec<UpdateDecision> {
        let st = self.state.read().await;
        let mut decisions: Vec<UpdateDecision> = st.update_decisions.values().cloned().collect();
        decisions.sort_by_key(|d| d.item_index);
        decisions
    }

    pub async fn item_statuses(&self) -> Vec<ItemStatus> {
        self.submission.item_statuses().await
    }

    pub async fn submission_progress(&self) -> Progress {
        self.submission.progress().await
    }

    pub async fn last_result(&self) -> Option<SubmissionResult> {
        self.submission.last_result().await
    }

    // ── Internals ──────────────────────────────────────────────────────────

    async fn require_phase(
        &self,
        allowed: &[WorkflowPhase],
        op: &str,
    ) -> Result<(), DomainError> {
        let phase = self.state.read().await.phase;
        if allowed.contains(&phase) {
            Ok(())
        } else {
            Err(DomainError::State(format!("cannot {op} in phase {phase}")))
        }
    }

    async fn route_analysis(&self, result: Result<AnalysisOutcome, DomainError>) {
        match result {
            Ok(AnalysisOutcome::Completed { failed_count }) => {
                self.spawn_post_analysis_effects();
                if failed_count == 0 {
                    self.enter_review().await;
                } else {
                    self.state.write().await.phase = WorkflowPhase::PartialAnalysis;
                }
            }
            Ok(AnalysisOutcome::Cancelled) => {
                let succeeded = self.analysis.success_count().await;
                let mut st = self.state.write().await;
                st.phase = if succeeded > 0 {
                    WorkflowPhase::PartialAnalysis
                } else {
                    WorkflowPhase::Capturing
                };
            }
            Err(e) => {
                warn!(error = %e, "analysis failed");
                let mut st = self.state.write().await;
                st.phase = WorkflowPhase::Capturing;
                st.error = Some(e.to_string());
            }
        }
    }

    async fn route_grouped_analysis(&self, result: Result<GroupedOutcome, DomainError>) {
        match result {
            Ok(GroupedOutcome::Completed { needs_grouping }) => {
                self.spawn_post_analysis_effects();
                if needs_grouping {
                    self.state.write().await.phase = WorkflowPhase::Grouping;
                } else {
                    self.enter_review().await;
                }
            }
            Ok(GroupedOutcome::Cancelled) => {
                self.state.write().await.phase = WorkflowPhase::Capturing;
            }
            Err(e) => {
                warn!(error = %e, "grouped analysis failed");
                let mut st = self.state.write().await;
                st.phase = WorkflowPhase::Capturing;
                st.error = Some(e.to_string());
            }
        }
    }

    async fn enter_review(&self) {
        let items = self.analysis.items().await;
        self.review.begin(items).await;
        let mut st = self.state.write().await;
        st.confirmed_map.clear();
        st.review_finished = false;
        st.phase = WorkflowPhase::Reviewing;
    }

    /// Review is over with at least one confirmation: remap duplicate
    /// matches from detected to confirmed indices (once) and move on.
    async fn finish_review(&self) {
        let mut st = self.state.write().await;
        if !st.review_finished {
            let map = st.confirmed_map.clone();
            let matches = std::mem::take(&mut st.duplicate_matches);
            st.duplicate_matches = remap_matches(matches, &map);
            st.review_finished = true;
        }
        st.phase = WorkflowPhase::Confirming;
    }

    async fn route_submission(&self, result: Result<SubmissionReport, DomainError>) {
        match result {
            Ok(report) => {
                let mut st = self.state.write().await;
                if report.halted {
                    // Cancelled: the loop halted in place, phase stays put.
                    return;
                }
                if report.failed_count == 0 {
                    st.phase = WorkflowPhase::Complete;
                } else if report.success_count + report.partial_count == 0 {
                    st.phase = WorkflowPhase::Confirming;
                    st.error = Some("all items failed to submit".to_string());
                }
                // Some failures: stay in submitting; per-item badges carry
                // the detail and retry targets only the failed subset.
            }
            Err(DomainError::SessionExpired) => {
                let mut st = self.state.write().await;
                st.phase = WorkflowPhase::Confirming;
                st.error =
                    Some("session expired; sign in again before submitting".to_string());
            }
            Err(e) => {
                warn!(error = %e, "submission failed");
                let mut st = self.state.write().await;
                st.phase = WorkflowPhase::Confirming;
                st.error = Some(e.to_string());
            }
        }
    }

    /// Completing analysis fires two detached side effects: a bulk duplicate
    /// check and, when enabled, AI enrichment. Both are failure-isolated and
    /// report back through service methods under the single-writer rule.
    fn spawn_post_analysis_effects(&self) {
        let analysis = Arc::clone(&self.analysis);
        let inventory = Arc::clone(&self.inventory);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let items = analysis.items().await;
            let candidates: Vec<(usize, ItemFields)> = items
                .iter()
                .enumerate()
                .filter(|(_, it)| it.fields.has_identifying_fields())
                .map(|(i, it)| (i, it.fields.clone()))
                .collect();
            if candidates.is_empty() {
                return;
            }
            let fields: Vec<ItemFields> = candidates.iter().map(|(_, f)| f.clone()).collect();
            match inventory.check_duplicates(&fields).await {
                Ok(matches) => {
                    let mapped: Vec<DuplicateMatch> = matches
                        .into_iter()
                        .filter_map(|m| {
                            candidates.get(m.candidate_index).map(|(item_index, _)| {
                                DuplicateMatch {
                                    item_index: *item_index,
                                    existing_id: m.existing_id,
                                    existing_name: m.existing_name,
                                    match_type: m.match_type,
                                    confidence: m.confidence,
                                    similarity: m.similarity,
                                }
                            })
                        })
                        .collect();
                    info!(matches = mapped.len(), "duplicate check complete");
                    let mut st = state.write().await;
                    st.duplicate_matches = if st.review_finished {
                        remap_matches(mapped, &st.confirmed_map)
                    } else {
                        mapped
                    };
                }
                Err(e) => warn!(error = %e, "duplicate check failed"),
            }
        });

        if self.auto_enrich {
            let analysis = Arc::clone(&self.analysis);
            let review = Arc::clone(&self.review);
            let vision = Arc::clone(&self.vision);
            tokio::spawn(async move {
                let items = analysis.items().await;
                for (i, item) in items.iter().enumerate() {
                    match vision.enrich_fields(&item.fields).await {
                        Ok(enriched) => {
                            analysis.apply_enrichment(i, enriched.clone()).await;
                            review.apply_enrichment(i, enriched).await;
                        }
                        Err(e) => warn!(index = i, error = %e, "enrichment failed"),
                    }
                }
            });
        }
    }
}

/// Move matches from detected-index space to confirmed-index space; matches
/// on skipped items are dropped.
fn remap_matches(
    matches: Vec<DuplicateMatch>,
    map: &HashMap<usize, usize>,
) -> Vec<DuplicateMatch> {
    matches
        .into_iter()
        .filter_map(|mut m| {
            map.get(&m.item_index).map(|&confirmed| {
                m.item_index = confirmed;
                m
            })
        })
        .collect()
}
