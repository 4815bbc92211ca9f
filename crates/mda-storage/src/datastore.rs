//! Datastores images end up in.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mda_core::axis::AxisCoords;
use mda_core::document::new_uid;
use mda_core::image::TaggedImage;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Destination of an acquisition's images.
///
/// `put_image` is called from the sink task in acquisition order. `freeze`
/// is called once after the last image; a frozen store rejects further
/// images.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Identifier reported in lifecycle documents.
    fn id(&self) -> &str;

    /// Store one image.
    async fn put_image(&self, image: TaggedImage) -> Result<()>;

    /// Finish the store.
    async fn freeze(&self) -> Result<()>;

    /// Whether `freeze` has completed.
    fn is_frozen(&self) -> bool;
}

#[derive(Default)]
struct MemoryInner {
    images: Vec<TaggedImage>,
    frozen: bool,
}

/// Keeps every image in memory. Used by tests and dry runs.
pub struct MemoryDatastore {
    id: String,
    inner: Mutex<MemoryInner>,
}

impl MemoryDatastore {
    /// Empty store with a generated id.
    pub fn new() -> Self {
        Self::with_id(format!("memory-{}", new_uid()))
    }

    /// Empty store with a fixed id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Number of images stored.
    pub fn len(&self) -> usize {
        self.inner.lock().images.len()
    }

    /// True when nothing was stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().images.is_empty()
    }

    /// Copies of the stored images, in arrival order.
    pub fn images(&self) -> Vec<TaggedImage> {
        self.inner.lock().images.clone()
    }

    /// Axis coordinates of the stored images, in arrival order.
    pub fn coords(&self) -> Vec<AxisCoords> {
        self.inner
            .lock()
            .images
            .iter()
            .map(|i| i.coords.clone())
            .collect()
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put_image(&self, image: TaggedImage) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.frozen {
            return Err(anyhow!("datastore '{}' is frozen", self.id));
        }
        inner.images.push(image);
        Ok(())
    }

    async fn freeze(&self) -> Result<()> {
        self.inner.lock().frozen = true;
        Ok(())
    }

    fn is_frozen(&self) -> bool {
        self.inner.lock().frozen
    }
}

/// Writes the metadata of every image as one JSON line to
/// `<root>/<name>/metadata.jsonl`. Pixels are dropped.
pub struct MetadataLogStore {
    id: String,
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
    count: Mutex<u64>,
}

impl MetadataLogStore {
    /// Create the run directory and open the log file.
    pub async fn create(root: &Path, name: &str) -> Result<Self> {
        let dir = unique_dir(root, name);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("metadata.jsonl");
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(Self {
            id: dir.display().to_string(),
            path,
            file: tokio::sync::Mutex::new(Some(file)),
            count: Mutex::new(0),
        })
    }

    /// Path of the JSON lines file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lines written.
    pub fn len(&self) -> u64 {
        *self.count.lock()
    }

    /// True when nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Directory holding the run's files.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(&self.path)
    }

    /// Delete the run directory if no image was written to it.
    ///
    /// Returns whether the directory was removed.
    pub async fn remove_if_empty(&self) -> Result<bool> {
        if !self.is_empty() {
            return Ok(false);
        }
        self.file.lock().await.take();
        tokio::fs::remove_dir_all(self.dir())
            .await
            .with_context(|| format!("removing {}", self.dir().display()))?;
        Ok(true)
    }
}

/// `<root>/<name>_<n>` with the first `n` that does not exist yet.
fn unique_dir(root: &Path, name: &str) -> PathBuf {
    let mut n = 1;
    loop {
        let candidate = root.join(format!("{}_{}", name, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[async_trait]
impl Datastore for MetadataLogStore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put_image(&self, image: TaggedImage) -> Result<()> {
        let mut line = serde_json::to_vec(&image.metadata_json()?)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| anyhow!("datastore '{}' is frozen", self.id))?;
        file.write_all(&line).await?;
        *self.count.lock() += 1;
        Ok(())
    }

    async fn freeze(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    fn is_frozen(&self) -> bool {
        self.file.try_lock().map_or(false, |f| f.is_none())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mda_core::axis::AxisKind;
    use mda_core::image::ImageMetadata;

    pub(crate) fn image(seq: u64) -> TaggedImage {
        TaggedImage {
            pixels: vec![seq as u16; 4],
            width: 2,
            height: 2,
            coords: AxisCoords::new().with(AxisKind::Time, seq as i64),
            metadata: ImageMetadata {
                run_uid: "run".into(),
                seq_num: seq,
                channel: None,
                z_um: None,
                xy_um: None,
                position_label: None,
                grid_row: None,
                grid_col: None,
                overlap_px: None,
                exposure_ms: None,
                elapsed_ms: 0.0,
                timestamp_ns: 0,
                shutter_open: false,
            },
        }
    }

    #[tokio::test]
    async fn test_memory_store_rejects_after_freeze() {
        let store = MemoryDatastore::with_id("mem");
        store.put_image(image(0)).await.unwrap();
        store.freeze().await.unwrap();
        assert!(store.is_frozen());
        assert!(store.put_image(image(1)).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_log_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataLogStore::create(dir.path(), "run").await.unwrap();
        store.put_image(image(0)).await.unwrap();
        store.put_image(image(1)).await.unwrap();
        store.freeze().await.unwrap();
        assert!(store.is_frozen());

        let text = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["seq_num"], 1);
        assert_eq!(second["coords"]["time"], 1);
    }

    #[tokio::test]
    async fn test_metadata_log_uses_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let a = MetadataLogStore::create(dir.path(), "run").await.unwrap();
        let b = MetadataLogStore::create(dir.path(), "run").await.unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.id().ends_with("run_1"));
        assert!(b.id().ends_with("run_2"));
    }

    #[tokio::test]
    async fn test_remove_if_empty_keeps_written_runs() {
        let dir = tempfile::tempdir().unwrap();
        let unused = MetadataLogStore::create(dir.path(), "run").await.unwrap();
        let used = MetadataLogStore::create(dir.path(), "run").await.unwrap();
        used.put_image(image(0)).await.unwrap();

        assert!(unused.remove_if_empty().await.unwrap());
        assert!(!unused.dir().exists());
        assert!(!used.remove_if_empty().await.unwrap());
        assert!(used.path().exists());
    }
}
