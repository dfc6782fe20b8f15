//! Mock vision adapter for testing without API calls.
//!
//! Returns scriptable responses per image file name and simulates network
//! latency with configurable delays. Cancellation cuts the delay short.

use crate::domain::{CapturedImage, CompressedImage, DomainError, ItemFields, TokenUsage};
use crate::ports::{DetectedGroup, Detection, VisionPort};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Default)]
struct MockVisionState {
    fail: HashSet<String>,
    scripted: HashMap<String, Vec<ItemFields>>,
    delays: HashMap<String, u64>,
    groups: Option<Vec<(Option<ItemFields>, Vec<usize>)>>,
    enrichment: Option<ItemFields>,
    detect_calls: HashMap<String, usize>,
}

/// Mock vision adapter. One default item per image unless scripted.
pub struct MockVisionAdapter {
    default_delay_ms: u64,
    state: Mutex<MockVisionState>,
}

impl MockVisionAdapter {
    pub fn new() -> Self {
        Self {
            default_delay_ms: 0,
            state: Mutex::new(MockVisionState::default()),
        }
    }

    /// Default simulated latency for every call.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.default_delay_ms = delay_ms;
        self
    }

    /// Latency override for one image file name.
    pub fn delay_for(self, file_name: &str, delay_ms: u64) -> Self {
        self.state
            .lock()
            .expect("mock state")
            .delays
            .insert(file_name.to_string(), delay_ms);
        self
    }

    /// Make detection fail for one image file name.
    pub fn fail_on(self, file_name: &str) -> Self {
        self.state
            .lock()
            .expect("mock state")
            .fail
            .insert(file_name.to_string());
        self
    }

    /// Script the detected items for one image file name.
    pub fn respond_with(self, file_name: &str, items: Vec<ItemFields>) -> Self {
        self.state
            .lock()
            .expect("mock state")
            .scripted
            .insert(file_name.to_string(), items);
        self
    }

    /// Script the grouped-detection response.
    pub fn with_groups(self, groups: Vec<(Option<ItemFields>, Vec<usize>)>) -> Self {
        self.state.lock().expect("mock state").groups = Some(groups);
        self
    }

    /// Script the enrichment result merged into every enriched item.
    pub fn with_enrichment(self, fields: ItemFields) -> Self {
        self.state.lock().expect("mock state").enrichment = Some(fields);
        self
    }

    /// Simulate endpoint recovery: clear every scripted failure.
    pub fn clear_failures(&self) {
        self.state.lock().expect("mock state").fail.clear();
    }

    /// How many detection calls one image file name received.
    pub fn detect_calls_for(&self, file_name: &str) -> usize {
        self.state
            .lock()
            .expect("mock state")
            .detect_calls
            .get(file_name)
            .copied()
            .unwrap_or(0)
    }

    async fn simulate_latency(&self, delay_ms: u64, cancel: &CancellationToken) -> bool {
        if delay_ms == 0 {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }
}

impl Default for MockVisionAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn file_stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

#[async_trait::async_trait]
impl VisionPort for MockVisionAdapter {
    async fn detect_items(
        &self,
        image: &CapturedImage,
        cancel: &CancellationToken,
    ) -> Result<Detection, DomainError> {
        let name = image.file_name();
        let (delay, should_fail, scripted) = {
            let mut st = self.state.lock().expect("mock state");
            *st.detect_calls.entry(name.clone()).or_insert(0) += 1;
            (
                st.delays.get(&name).copied().unwrap_or(self.default_delay_ms),
                st.fail.contains(&name),
                st.scripted.get(&name).cloned(),
            )
        };

        if !self.simulate_latency(delay, cancel).await {
            return Err(DomainError::Vision("detection cancelled".to_string()));
        }
        if should_fail {
            return Err(DomainError::Vision(format!(
                "[MOCK] detection failed for {name}"
            )));
        }

        let stem = file_stem(&name).to_string();
        let items = scripted.unwrap_or_else(|| vec![ItemFields::named(&stem)]);
        info!(image = %name, items = items.len(), "[MOCK] simulated detection");

        Ok(Detection {
            items,
            compressed: vec![CompressedImage {
                filename: format!("{stem}.webp"),
                mime: "image/webp".to_string(),
                data: b"RIFF-mock".to_vec(),
            }],
            token_usage: Some(TokenUsage {
                prompt_tokens: 1200,
                completion_tokens: 250,
            }),
        })
    }

    async fn detect_grouped(
        &self,
        images: &[CapturedImage],
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectedGroup>, DomainError> {
        if !self.simulate_latency(self.default_delay_ms, cancel).await {
            return Err(DomainError::Vision("detection cancelled".to_string()));
        }

        let scripted = self.state.lock().expect("mock state").groups.clone();
        if let Some(groups) = scripted {
            return Ok(groups
                .into_iter()
                .map(|(item, image_indices)| DetectedGroup {
                    item,
                    image_indices,
                })
                .collect());
        }

        // Default: each image is its own single-item group.
        Ok(images
            .iter()
            .enumerate()
            .map(|(i, image)| DetectedGroup {
                item: Some(ItemFields::named(file_stem(&image.file_name()))),
                image_indices: vec![i],
            })
            .collect())
    }

    async fn enrich_fields(&self, fields: &ItemFields) -> Result<ItemFields, DomainError> {
        let scripted = self.state.lock().expect("mock state").enrichment.clone();
        Ok(scripted.unwrap_or_else(|| fields.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_detection_names_item_after_file() {
        let adapter = MockVisionAdapter::new();
        let cancel = CancellationToken::new();
        let image = CapturedImage::new("/photos/toolbox.jpg");

        let detection = adapter.detect_items(&image, &cancel).await.unwrap();
        assert_eq!(detection.items.len(), 1);
        assert_eq!(detection.items[0].name, "toolbox");
        assert_eq!(detection.compressed[0].filename, "toolbox.webp");
        assert_eq!(adapter.detect_calls_for("toolbox.jpg"), 1);
    }

    #[tokio::test]
    async fn test_cancel_cuts_delay_short() {
        let adapter = MockVisionAdapter::new().with_delay(5_000);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let image = CapturedImage::new("/photos/a.jpg");
        let start = std::time::Instant::now();
        let result = adapter.detect_items(&image, &cancel).await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
