//! Analysis service: bounded-concurrency AI detection over captured images.
//!
//! A fixed worker pool draws image indices from a shared atomic cursor; the
//! claim is taken before any await, so no two workers ever process the same
//! image. Completion order is undefined; result placement is keyed by the
//! original image index, so final ordering is deterministic.

use crate::domain::{
    CapturedImage, DomainError, ImageGroup, ImageStatus, ItemFields, Progress, ReviewItem,
    TokenUsage,
};
use crate::ports::{Detection, FieldPreferences, InventoryPort, VisionPort};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a per-image analysis run. Cancellation is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Completed { failed_count: usize },
    Cancelled,
}

/// Outcome of a grouped analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupedOutcome {
    Completed { needs_grouping: bool },
    Cancelled,
}

#[derive(Default)]
struct AnalysisState {
    statuses: Vec<ImageStatus>,
    unit_errors: HashMap<usize, String>,
    items: Vec<ReviewItem>,
    groups: Vec<ImageGroup>,
    progress: Progress,
    token_usage: TokenUsage,
    cancel: Option<CancellationToken>,
}

/// Runs detection over captured images and aggregates the results.
pub struct AnalysisService {
    vision: Arc<dyn VisionPort>,
    inventory: Arc<dyn InventoryPort>,
    worker_cap: usize,
    /// Field preferences are fetched once per session; a fetch failure is
    /// tolerated and cached as None.
    prefs: OnceCell<Option<FieldPreferences>>,
    state: RwLock<AnalysisState>,
}

impl AnalysisService {
    pub fn new(
        vision: Arc<dyn VisionPort>,
        inventory: Arc<dyn InventoryPort>,
        worker_cap: usize,
    ) -> Self {
        Self {
            vision,
            inventory,
            worker_cap: worker_cap.max(1),
            prefs: OnceCell::new(),
            state: RwLock::new(AnalysisState::default()),
        }
    }

    /// Analyze every image. Statuses are fully populated before the pool
    /// starts.
    pub async fn run(&self, images: Vec<CapturedImage>) -> Result<AnalysisOutcome, DomainError> {
        let total = images.len();
        if total == 0 {
            return Err(DomainError::State("no images to analyze".to_string()));
        }

        let cancel = CancellationToken::new();
        {
            let mut st = self.state.write().await;
            st.statuses = vec![ImageStatus::Pending; total];
            st.unit_errors.clear();
            st.items.clear();
            st.groups.clear();
            st.token_usage = TokenUsage::default();
            st.progress = Progress::new(0, total, "Analyzing images");
            st.cancel = Some(cancel.clone());
        }

        let targets: Vec<usize> = (0..total).collect();
        self.run_pool(&images, &targets, &cancel).await;
        self.evaluate(&cancel).await
    }

    /// Re-run only the images that are not yet successful, merging new
    /// results with previously successful items.
    pub async fn retry_failed(
        &self,
        images: Vec<CapturedImage>,
    ) -> Result<AnalysisOutcome, DomainError> {
        let cancel = CancellationToken::new();
        let targets: Vec<usize> = {
            let mut st = self.state.write().await;
            let targets: Vec<usize> = st
                .statuses
                .iter()
                .enumerate()
                .filter(|(_, s)| **s != ImageStatus::Success)
                .map(|(i, _)| i)
                .collect();
            for &i in &targets {
                st.statuses[i] = ImageStatus::Pending;
                st.unit_errors.remove(&i);
            }
            st.progress = Progress::new(0, targets.len(), "Retrying failed images");
            st.cancel = Some(cancel.clone());
            targets
        };
        if targets.is_empty() {
            return Err(DomainError::State("no failed images to retry".to_string()));
        }

        info!(count = targets.len(), "retrying failed images");
        self.run_pool(&images, &targets, &cancel).await;
        self.evaluate(&cancel).await
    }

    /// Analyze all images in one grouped-detection call.
    pub async fn run_grouped(
        &self,
        images: Vec<CapturedImage>,
    ) -> Result<GroupedOutcome, DomainError> {
        let total = images.len();
        if total == 0 {
            return Err(DomainError::State("no images to analyze".to_string()));
        }

        let cancel = CancellationToken::new();
        {
            let mut st = self.state.write().await;
            st.statuses = vec![ImageStatus::Analyzing; total];
            st.unit_errors.clear();
            st.items.clear();
            st.groups.clear();
            st.progress = Progress::new(0, 1, "Analyzing image groups");
            st.cancel = Some(cancel.clone());
        }

        let result = self.vision.detect_grouped(&images, &cancel).await;
        if cancel.is_cancelled() {
            let mut st = self.state.write().await;
            for status in st.statuses.iter_mut() {
                *status = ImageStatus::Pending;
            }
            st.cancel = None;
            return Ok(GroupedOutcome::Cancelled);
        }

        let detected = match result {
            Ok(groups) => groups,
            Err(e) => {
                let mut st = self.state.write().await;
                for status in st.statuses.iter_mut() {
                    *status = ImageStatus::Failed;
                }
                st.cancel = None;
                return Err(e);
            }
        };

        let default_label = self.default_label().await;
        let groups: Vec<ImageGroup> = detected
            .into_iter()
            .enumerate()
            .map(|(i, g)| {
                let source = g.image_indices.first().copied().unwrap_or(0);
                let item = g.item.map(|mut fields| {
                    apply_default_label(&mut fields, default_label.as_deref());
                    ReviewItem::new(fields, source)
                });
                ImageGroup {
                    id: format!("group-{}", i + 1),
                    item,
                    image_indices: g.image_indices,
                }
            })
            .collect();

        let needs_grouping = groups.iter().any(ImageGroup::needs_review);
        let items: Vec<ReviewItem> = groups.iter().filter_map(|g| g.item.clone()).collect();

        let mut st = self.state.write().await;
        for status in st.statuses.iter_mut() {
            *status = ImageStatus::Success;
        }
        st.progress = Progress::new(1, 1, "Group analysis complete");
        st.groups = groups;
        st.items = items;
        st.cancel = None;
        Ok(GroupedOutcome::Completed { needs_grouping })
    }

    /// Store the user-confirmed grouping and rebuild the item list from it.
    pub async fn apply_grouping(&self, groups: Vec<ImageGroup>) -> Vec<ReviewItem> {
        let items: Vec<ReviewItem> = groups
            .iter()
            .filter_map(|g| {
                let mut item = g.item.clone()?;
                item.source_image_index = g.image_indices.first().copied().unwrap_or(0);
                Some(item)
            })
            .collect();

        let mut st = self.state.write().await;
        st.groups = groups;
        st.items = items.clone();
        items
    }

    /// Drop every non-successful image slot and re-derive the surviving
    /// items' source indices. Returns the removed original indices.
    pub async fn remove_failed_images(&self) -> Vec<usize> {
        let mut st = self.state.write().await;
        let removed: Vec<usize> = st
            .statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != ImageStatus::Success)
            .map(|(i, _)| i)
            .collect();
        if removed.is_empty() {
            return removed;
        }

        for item in st.items.iter_mut() {
            let shift = removed
                .iter()
                .filter(|&&r| r < item.source_image_index)
                .count();
            item.source_image_index -= shift;
        }

        let surviving = st.statuses.len() - removed.len();
        st.statuses = vec![ImageStatus::Success; surviving];
        st.unit_errors.clear();
        info!(removed = removed.len(), surviving, "removed failed images");
        removed
    }

    /// Merge enrichment results into a detected item, filling only missing
    /// fields. No-op for indices that no longer exist.
    pub async fn apply_enrichment(&self, index: usize, enriched: ItemFields) {
        let mut st = self.state.write().await;
        if let Some(item) = st.items.get_mut(index) {
            item.fields.fill_missing_from(enriched);
        }
    }

    /// Request cancellation of the in-flight run. Silent no-op otherwise.
    pub async fn cancel(&self) {
        if let Some(token) = self.state.read().await.cancel.clone() {
            token.cancel();
        }
    }

    pub async fn statuses(&self) -> Vec<ImageStatus> {
        self.state.read().await.statuses.clone()
    }

    pub async fn items(&self) -> Vec<ReviewItem> {
        self.state.read().await.items.clone()
    }

    pub async fn groups(&self) -> Vec<ImageGroup> {
        self.state.read().await.groups.clone()
    }

    pub async fn progress(&self) -> Progress {
        self.state.read().await.progress.clone()
    }

    pub async fn unit_errors(&self) -> HashMap<usize, String> {
        self.state.read().await.unit_errors.clone()
    }

    pub async fn token_usage(&self) -> TokenUsage {
        self.state.read().await.token_usage
    }

    pub async fn success_count(&self) -> usize {
        self.state
            .read()
            .await
            .statuses
            .iter()
            .filter(|s| **s == ImageStatus::Success)
            .count()
    }

    pub async fn failed_count(&self) -> usize {
        self.state
            .read()
            .await
            .statuses
            .iter()
            .filter(|s| **s != ImageStatus::Success)
            .count()
    }

    pub async fn reset(&self) {
        let mut st = self.state.write().await;
        *st = AnalysisState::default();
    }

    /// Run `min(worker_cap, targets)` workers over a shared claim cursor.
    async fn run_pool(
        &self,
        images: &[CapturedImage],
        targets: &[usize],
        cancel: &CancellationToken,
    ) {
        let workers = self.worker_cap.min(targets.len());
        let cursor = AtomicUsize::new(0);
        debug!(workers, targets = targets.len(), "starting analysis pool");

        let handles: Vec<_> = (0..workers)
            .map(|_| self.worker_loop(images, targets, &cursor, cancel))
            .collect();
        futures::future::join_all(handles).await;
    }

    async fn worker_loop(
        &self,
        images: &[CapturedImage],
        targets: &[usize],
        cursor: &AtomicUsize,
        cancel: &CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            // Claim before the await: the atomic increment guarantees no two
            // workers ever take the same slot.
            let slot = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(&image_index) = targets.get(slot) else {
                break;
            };

            {
                let mut st = self.state.write().await;
                st.statuses[image_index] = ImageStatus::Analyzing;
            }

            let image = &images[image_index];
            let result = self.vision.detect_items(image, cancel).await;
            if cancel.is_cancelled() {
                // Aborting mid-call is a silent outcome; statuses are
                // normalized by evaluate().
                break;
            }

            match result {
                Ok(detection) => {
                    let token_usage = detection.token_usage;
                    let items = assemble_items(image_index, detection);
                    let detected = items.len();
                    let mut st = self.state.write().await;
                    st.statuses[image_index] = ImageStatus::Success;
                    st.items.extend(items);
                    if let Some(usage) = token_usage {
                        st.token_usage.add(usage);
                    }
                    st.progress.current += 1;
                    st.progress.message = format!(
                        "Analyzed {} of {} images",
                        st.progress.current, st.progress.total
                    );
                    debug!(image_index, detected, "image analyzed");
                }
                Err(e) => {
                    warn!(image_index, error = %e, "image analysis failed");
                    let mut st = self.state.write().await;
                    st.statuses[image_index] = ImageStatus::Failed;
                    st.unit_errors.insert(image_index, e.to_string());
                    st.progress.current += 1;
                    st.progress.message = format!(
                        "Analyzed {} of {} images",
                        st.progress.current, st.progress.total
                    );
                }
            }
        }
    }

    /// Turn the finished pool into an outcome: normalize cancelled statuses,
    /// apply the failure policy, order items, apply the default label.
    async fn evaluate(&self, cancel: &CancellationToken) -> Result<AnalysisOutcome, DomainError> {
        if cancel.is_cancelled() {
            let mut st = self.state.write().await;
            for status in st.statuses.iter_mut() {
                if *status == ImageStatus::Analyzing {
                    *status = ImageStatus::Pending;
                }
            }
            st.cancel = None;
            info!("analysis cancelled");
            return Ok(AnalysisOutcome::Cancelled);
        }

        let default_label = self.default_label().await;

        let mut st = self.state.write().await;
        st.cancel = None;
        let failed = st
            .statuses
            .iter()
            .filter(|s| **s != ImageStatus::Success)
            .count();
        if failed == st.statuses.len() {
            return Err(DomainError::Vision(
                "image analysis failed for all images".to_string(),
            ));
        }

        st.items.sort_by_key(|item| item.source_image_index);
        for item in st.items.iter_mut() {
            apply_default_label(&mut item.fields, default_label.as_deref());
        }

        if st.items.is_empty() {
            return Err(DomainError::Vision(
                "no items detected in any image".to_string(),
            ));
        }

        info!(
            items = st.items.len(),
            failed,
            prompt_tokens = st.token_usage.prompt_tokens,
            "analysis complete"
        );
        Ok(AnalysisOutcome::Completed {
            failed_count: failed,
        })
    }

    async fn default_label(&self) -> Option<String> {
        let prefs = self
            .prefs
            .get_or_init(|| async {
                match self.inventory.field_preferences().await {
                    Ok(prefs) => Some(prefs),
                    Err(e) => {
                        warn!(error = %e, "field preferences unavailable");
                        None
                    }
                }
            })
            .await;
        prefs
            .as_ref()
            .and_then(|p| p.valid_default_label())
            .map(|s| s.to_string())
    }
}

/// Apply the cached default label when the item has no copy of it yet.
fn apply_default_label(fields: &mut ItemFields, default_label: Option<&str>) {
    if let Some(label) = default_label {
        if !fields.label_ids.iter().any(|l| l == label) {
            fields.label_ids.push(label.to_string());
        }
    }
}

/// Split one detection into review items: compressed variants become one
/// primary plus N extras, shared by every item from the source image.
fn assemble_items(image_index: usize, detection: Detection) -> Vec<ReviewItem> {
    let mut compressed = detection.compressed.into_iter();
    let primary = compressed.next();
    let extras: Vec<_> = compressed.collect();

    detection
        .items
        .into_iter()
        .map(|fields| {
            let mut item = ReviewItem::new(fields, image_index);
            item.compressed_primary = primary.clone();
            item.compressed_extras = extras.clone();
            item
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::inventory::MockInventoryAdapter;
    use crate::adapters::vision::MockVisionAdapter;

    fn image(name: &str) -> CapturedImage {
        CapturedImage::new(format!("/photos/{name}"))
    }

    fn service(vision: Arc<MockVisionAdapter>, inventory: MockInventoryAdapter) -> AnalysisService {
        AnalysisService::new(vision, Arc::new(inventory), 3)
    }

    #[tokio::test]
    async fn test_processes_every_image_exactly_once() {
        let svc = service(
            Arc::new(MockVisionAdapter::new()),
            MockInventoryAdapter::new(),
        );
        let images: Vec<_> = (0..5).map(|i| image(&format!("img{i}.jpg"))).collect();

        let outcome = svc.run(images).await.unwrap();
        assert_eq!(outcome, AnalysisOutcome::Completed { failed_count: 0 });

        let statuses = svc.statuses().await;
        assert_eq!(statuses.len(), 5);
        assert!(statuses.iter().all(|s| *s == ImageStatus::Success));

        // One item per image, reassembled in original order.
        let items = svc.items().await;
        assert_eq!(items.len(), 5);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.source_image_index, i);
        }
    }

    #[tokio::test]
    async fn test_partial_failure_reports_failed_count() {
        let vision = Arc::new(MockVisionAdapter::new().fail_on("img1.jpg"));
        let svc = service(vision, MockInventoryAdapter::new());
        let images = vec![image("img0.jpg"), image("img1.jpg"), image("img2.jpg")];

        let outcome = svc.run(images).await.unwrap();
        assert_eq!(outcome, AnalysisOutcome::Completed { failed_count: 1 });

        let statuses = svc.statuses().await;
        assert_eq!(statuses[0], ImageStatus::Success);
        assert_eq!(statuses[1], ImageStatus::Failed);
        assert_eq!(statuses[2], ImageStatus::Success);
        assert_eq!(svc.items().await.len(), 2);
        assert!(svc.unit_errors().await.contains_key(&1));
    }

    #[tokio::test]
    async fn test_all_failed_is_an_error() {
        let vision = Arc::new(MockVisionAdapter::new().fail_on("a.jpg").fail_on("b.jpg"));
        let svc = service(vision, MockInventoryAdapter::new());

        let result = svc.run(vec![image("a.jpg"), image("b.jpg")]).await;
        assert!(matches!(result, Err(DomainError::Vision(_))));
    }

    #[tokio::test]
    async fn test_no_detections_is_an_error() {
        let vision = Arc::new(MockVisionAdapter::new().respond_with("a.jpg", Vec::new()));
        let svc = service(vision, MockInventoryAdapter::new());

        let result = svc.run(vec![image("a.jpg")]).await;
        match result {
            Err(DomainError::Vision(msg)) => assert!(msg.contains("no items")),
            other => panic!("expected vision error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_merges_with_previous_successes() {
        let vision = Arc::new(MockVisionAdapter::new().fail_on("img1.jpg"));
        let svc = service(Arc::clone(&vision), MockInventoryAdapter::new());
        let images = vec![image("img0.jpg"), image("img1.jpg"), image("img2.jpg")];

        let outcome = svc.run(images.clone()).await.unwrap();
        assert_eq!(outcome, AnalysisOutcome::Completed { failed_count: 1 });

        // The endpoint recovers; only image 1 is re-analyzed.
        vision.clear_failures();
        let outcome = svc.retry_failed(images).await.unwrap();
        assert_eq!(outcome, AnalysisOutcome::Completed { failed_count: 0 });

        let items = svc.items().await;
        assert_eq!(items.len(), 3);
        let sources: Vec<_> = items.iter().map(|i| i.source_image_index).collect();
        assert_eq!(sources, vec![0, 1, 2]);
        // Image 0 was analyzed exactly once across both runs.
        assert_eq!(vision.detect_calls_for("img0.jpg"), 1);
        assert_eq!(vision.detect_calls_for("img1.jpg"), 2);
    }

    #[tokio::test]
    async fn test_remove_failed_images_reindexes_survivors() {
        let vision = Arc::new(
            MockVisionAdapter::new()
                .fail_on("img1.jpg")
                .fail_on("img3.jpg"),
        );
        let svc = service(vision, MockInventoryAdapter::new());
        let images: Vec<_> = (0..5).map(|i| image(&format!("img{i}.jpg"))).collect();

        svc.run(images).await.unwrap();
        let removed = svc.remove_failed_images().await;
        assert_eq!(removed, vec![1, 3]);

        // Original indices 0, 2, 4 must now read 0, 1, 2.
        let sources: Vec<_> = svc
            .items()
            .await
            .iter()
            .map(|i| i.source_image_index)
            .collect();
        assert_eq!(sources, vec![0, 1, 2]);
        assert_eq!(svc.statuses().await.len(), 3);
        assert_eq!(svc.failed_count().await, 0);
    }

    #[tokio::test]
    async fn test_default_label_applied_only_when_still_known() {
        let inventory = MockInventoryAdapter::new()
            .with_preferences(Some("lbl-tools"), &["lbl-tools", "lbl-other"]);
        let svc = service(Arc::new(MockVisionAdapter::new()), inventory);

        svc.run(vec![image("a.jpg")]).await.unwrap();
        let items = svc.items().await;
        assert_eq!(items[0].fields.label_ids, vec!["lbl-tools".to_string()]);

        // Stale default: label no longer in the set.
        let inventory = MockInventoryAdapter::new().with_preferences(Some("gone"), &["lbl-a"]);
        let svc = service(Arc::new(MockVisionAdapter::new()), inventory);
        svc.run(vec![image("a.jpg")]).await.unwrap();
        assert!(svc.items().await[0].fields.label_ids.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_is_silent_and_normalizes_statuses() {
        let vision = Arc::new(MockVisionAdapter::new().with_delay(300));
        let svc = Arc::new(service(vision, MockInventoryAdapter::new()));
        let images = vec![image("a.jpg"), image("b.jpg")];

        let runner = Arc::clone(&svc);
        let handle = tokio::spawn(async move { runner.run(images).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        svc.cancel().await;

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, AnalysisOutcome::Cancelled);
        assert!(svc
            .statuses()
            .await
            .iter()
            .all(|s| *s != ImageStatus::Analyzing));
    }

    #[tokio::test]
    async fn test_grouped_run_flags_multi_image_groups() {
        let vision = Arc::new(MockVisionAdapter::new().with_groups(vec![
            (Some(ItemFields::named("Desk")), vec![0, 1]),
            (Some(ItemFields::named("Chair")), vec![2]),
        ]));
        let svc = service(vision, MockInventoryAdapter::new());
        let images = vec![image("a.jpg"), image("b.jpg"), image("c.jpg")];

        let outcome = svc.run_grouped(images).await.unwrap();
        assert_eq!(
            outcome,
            GroupedOutcome::Completed {
                needs_grouping: true
            }
        );
        assert_eq!(svc.groups().await.len(), 2);
        assert_eq!(svc.items().await.len(), 2);
        assert_eq!(svc.items().await[0].source_image_index, 0);
    }

    #[tokio::test]
    async fn test_grouped_run_single_groups_skip_review() {
        let vision = Arc::new(MockVisionAdapter::new().with_groups(vec![
            (Some(ItemFields::named("Desk")), vec![0]),
            (Some(ItemFields::named("Chair")), vec![1]),
        ]));
        let svc = service(vision, MockInventoryAdapter::new());

        let outcome = svc
            .run_grouped(vec![image("a.jpg"), image("b.jpg")])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            GroupedOutcome::Completed {
                needs_grouping: false
            }
        );
    }
}
