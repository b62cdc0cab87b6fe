use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Result};
use log::{debug, info};

use crate::{
    model::{Image, ImageStream, Snapshot},
    prune::{ImageDeleter, ImageStreamDeleter},
};

/// Records deleted images and updated streams in a [`Snapshot`], to be written back out once
/// pruning is done.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshot: Mutex<Snapshot>,
}

impl SnapshotStore {
    pub fn new(snapshot: Snapshot) -> Self {
        SnapshotStore {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn into_snapshot(self) -> Snapshot {
        self.snapshot
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ImageDeleter for SnapshotStore {
    async fn delete_image(&self, image: &Image) -> Result<()> {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        let before = snapshot.images.len();
        snapshot.images.retain(|i| i.name() != image.name());
        if snapshot.images.len() == before {
            debug!("Image {} is already gone", image.name());
        } else {
            info!("Deleted image {}", image.name());
        }
        Ok(())
    }
}

impl ImageStreamDeleter for SnapshotStore {
    async fn delete_image_stream(
        &self,
        stream: &ImageStream,
        image: &Image,
        updated_tags: &[String],
    ) -> Result<ImageStream> {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = snapshot
            .image_streams
            .iter_mut()
            .find(|s| s.full_name() == stream.full_name())
        else {
            bail!("image stream {} not found", stream.full_name());
        };

        info!(
            "Updated image stream {} without image {} (tags: {})",
            stream.full_name(),
            image.name(),
            updated_tags.join(", ")
        );
        *stored = stream.clone();
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::*;

    #[tokio::test]
    async fn test_store() {
        let store = SnapshotStore::new(Snapshot {
            images: vec![image(1, Age::Hours(1)), image(2, Age::Hours(1))],
            image_streams: vec![stream("ns", "is", Age::Hours(1), &[("latest", &[1, 2])])],
            ..Default::default()
        });

        let img = image(2, Age::Hours(1));
        store.delete_image(&img).await.unwrap();
        store.delete_image(&img).await.unwrap();
        assert_eq!(store.snapshot().images.len(), 1);

        let updated = stream("ns", "is", Age::Hours(1), &[("latest", &[1])]);
        let stored = store
            .delete_image_stream(&updated, &img, &["latest".to_string()])
            .await
            .unwrap();
        assert_eq!(stored, updated);
        assert_eq!(store.into_snapshot().image_streams, vec![updated]);

        let missing = SnapshotStore::default();
        let err = missing
            .delete_image_stream(&stream("ns", "gone", Age::Hours(1), &[]), &img, &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "image stream ns/gone not found".to_string());
    }
}
