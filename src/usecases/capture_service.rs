//! Capture service: owns the list of captured images and per-image options.
//!
//! Pure CRUD; index consistency here is consumed by analysis and review.

use crate::domain::{CapturedImage, DomainError};
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Owns the captured-image list. Single writer for that collection.
#[derive(Default)]
pub struct CaptureService {
    images: RwLock<Vec<CapturedImage>>,
}

impl CaptureService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image. Returns its index.
    pub async fn add(&self, image: CapturedImage) -> usize {
        let mut images = self.images.write().await;
        images.push(image);
        images.len() - 1
    }

    /// Remove the image at `index`.
    pub async fn remove(&self, index: usize) -> Result<CapturedImage, DomainError> {
        let mut images = self.images.write().await;
        if index >= images.len() {
            return Err(DomainError::State(format!(
                "image index {index} out of range ({} images)",
                images.len()
            )));
        }
        Ok(images.remove(index))
    }

    /// Remove several images by original index. Indices are deduplicated and
    /// removed highest-first so earlier removals cannot shift later ones.
    pub async fn remove_many(&self, indices: &[usize]) -> usize {
        let mut sorted: Vec<usize> = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut images = self.images.write().await;
        let mut removed = 0;
        for &index in sorted.iter().rev() {
            if index < images.len() {
                images.remove(index);
                removed += 1;
            }
        }
        removed
    }

    /// Update the per-image analysis options.
    pub async fn update_options(
        &self,
        index: usize,
        separate_items: bool,
        instructions: Option<String>,
    ) -> Result<(), DomainError> {
        let mut images = self.images.write().await;
        let image = images.get_mut(index).ok_or_else(|| {
            DomainError::State(format!("image index {index} out of range"))
        })?;
        image.separate_items = separate_items;
        image.instructions = instructions;
        Ok(())
    }

    /// Attach an additional angle shot to the image at `index`.
    pub async fn add_extra_angle(
        &self,
        index: usize,
        path: PathBuf,
    ) -> Result<(), DomainError> {
        let mut images = self.images.write().await;
        let image = images.get_mut(index).ok_or_else(|| {
            DomainError::State(format!("image index {index} out of range"))
        })?;
        image.extra_angles.push(path);
        Ok(())
    }

    /// Remove one additional angle shot.
    pub async fn remove_extra_angle(
        &self,
        index: usize,
        angle_index: usize,
    ) -> Result<(), DomainError> {
        let mut images = self.images.write().await;
        let image = images.get_mut(index).ok_or_else(|| {
            DomainError::State(format!("image index {index} out of range"))
        })?;
        if angle_index >= image.extra_angles.len() {
            return Err(DomainError::State(format!(
                "angle index {angle_index} out of range"
            )));
        }
        image.extra_angles.remove(angle_index);
        Ok(())
    }

    pub async fn clear(&self) {
        self.images.write().await.clear();
    }

    pub async fn images(&self) -> Vec<CapturedImage> {
        self.images.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.images.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.images.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str) -> CapturedImage {
        CapturedImage::new(format!("/photos/{name}"))
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let capture = CaptureService::new();
        assert_eq!(capture.add(image("a.jpg")).await, 0);
        assert_eq!(capture.add(image("b.jpg")).await, 1);

        let removed = capture.remove(0).await.unwrap();
        assert!(removed.file_path.ends_with("a.jpg"));
        assert_eq!(capture.len().await, 1);

        assert!(capture.remove(5).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_many_is_order_independent() {
        let capture = CaptureService::new();
        for name in ["a.jpg", "b.jpg", "c.jpg", "d.jpg"] {
            capture.add(image(name)).await;
        }

        // Unsorted with a duplicate; survivors must be b and d.
        let removed = capture.remove_many(&[2, 0, 2]).await;
        assert_eq!(removed, 2);

        let images = capture.images().await;
        assert_eq!(images.len(), 2);
        assert!(images[0].file_path.ends_with("b.jpg"));
        assert!(images[1].file_path.ends_with("d.jpg"));
    }

    #[tokio::test]
    async fn test_update_options_and_angles() {
        let capture = CaptureService::new();
        capture.add(image("a.jpg")).await;

        capture
            .update_options(0, true, Some("two items on the shelf".to_string()))
            .await
            .unwrap();
        capture
            .add_extra_angle(0, PathBuf::from("/photos/a-side.jpg"))
            .await
            .unwrap();

        let images = capture.images().await;
        assert!(images[0].separate_items);
        assert_eq!(images[0].extra_angles.len(), 1);

        capture.remove_extra_angle(0, 0).await.unwrap();
        assert!(capture.images().await[0].extra_angles.is_empty());
        assert!(capture.remove_extra_angle(0, 3).await.is_err());
    }
}
