//! Block device backed by a remote object.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use cinder_common::{CinderError, CinderResult, ResultExt};
use cinder_storage::ObjectStore;

use crate::chunk::ChunkStore;
use crate::device::ReadonlyDevice;

/// A read-only device whose contents live in object storage and are cached
/// locally chunk by chunk on first access.
#[derive(Debug)]
pub struct RemoteDevice {
    store: ChunkStore,
    closed: AtomicBool,
    remove_on_close: bool,
}

impl RemoteDevice {
    /// Open `object` from `source`, caching it in `cache_path`.
    ///
    /// The object length is looked up once, here.
    ///
    /// # Errors
    ///
    /// Returns an error if the object length cannot be determined or the
    /// cache file cannot be created.
    pub async fn open(
        source: Arc<dyn ObjectStore>,
        object: impl Into<String>,
        chunk_size: u64,
        cache_path: impl AsRef<Path>,
    ) -> CinderResult<Self> {
        let object = object.into();
        let size = source
            .size(&object)
            .await
            .with_context(|| format!("getting size of {object}"))?;

        let store = ChunkStore::create(source, object, size, chunk_size, cache_path.as_ref()).await?;

        Ok(Self {
            store,
            closed: AtomicBool::new(false),
            remove_on_close: true,
        })
    }

    /// Keep the cache file on close instead of deleting it.
    #[must_use]
    pub fn with_remove_on_close(mut self, remove: bool) -> Self {
        self.remove_on_close = remove;
        self
    }

    /// Remote object path.
    #[must_use]
    pub fn object(&self) -> &str {
        self.store.object()
    }

    /// Local cache file.
    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        self.store.cache_path().to_path_buf()
    }

    /// Number of chunks fetched from the remote object so far.
    #[must_use]
    pub fn fetched_chunks(&self) -> u64 {
        self.store.fetched_chunks()
    }

    /// Number of chunks cached locally.
    #[must_use]
    pub fn present_chunks(&self) -> u64 {
        self.store.present_chunks()
    }

    fn ensure_open(&self) -> CinderResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CinderError::DeviceClosed {
                device: self.store.object().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReadonlyDevice for RemoteDevice {
    async fn read_at(&self, offset: u64, length: u64) -> CinderResult<Bytes> {
        self.ensure_open()?;
        self.store.read_at(offset, length).await
    }

    fn size(&self) -> u64 {
        self.store.size()
    }

    fn block_size(&self) -> u64 {
        self.store.chunk_size()
    }

    async fn close(&self) -> CinderResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::debug!(object = %self.store.object(), "Closing remote device");

        if !self.remove_on_close {
            return Ok(());
        }

        match tokio::fs::remove_file(self.store.cache_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CinderError::from(e)
                .context(format!("removing cache {}", self.store.cache_path().display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_storage::MemoryBucket;

    #[tokio::test]
    async fn size_is_looked_up_once() {
        let bucket = Arc::new(MemoryBucket::new().with_object("b/rootfs.ext4", vec![7u8; 10_000]));
        let temp = tempfile::tempdir().unwrap();

        let device = RemoteDevice::open(bucket.clone(), "b/rootfs.ext4", 4096, temp.path().join("rootfs"))
            .await
            .unwrap();

        assert_eq!(device.size(), 10_000);
        device.read_at(0, 10_000).await.unwrap();
        assert_eq!(device.size(), 10_000);
        assert_eq!(bucket.size_lookups(), 1);
        assert_eq!(device.fetched_chunks(), 3);
    }

    #[tokio::test]
    async fn missing_object_fails_open() {
        let bucket = Arc::new(MemoryBucket::new());
        let temp = tempfile::tempdir().unwrap();

        let err = RemoteDevice::open(bucket, "b/memfile", 4096, temp.path().join("memfile"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("b/memfile"));
    }

    #[tokio::test]
    async fn close_removes_cache_and_blocks_reads() {
        let bucket = Arc::new(MemoryBucket::new().with_object("obj", vec![1u8; 4096]));
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("cache");

        let device = RemoteDevice::open(bucket, "obj", 4096, &path).await.unwrap();
        assert!(path.exists());

        device.close().await.unwrap();
        assert!(!path.exists());
        assert!(matches!(
            device.read_at(0, 1).await,
            Err(CinderError::DeviceClosed { .. })
        ));

        // Closing twice is harmless.
        device.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_can_keep_cache() {
        let bucket = Arc::new(MemoryBucket::new().with_object("obj", vec![1u8; 4096]));
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("cache");

        let device = RemoteDevice::open(bucket, "obj", 4096, &path)
            .await
            .unwrap()
            .with_remove_on_close(false);
        device.close().await.unwrap();
        assert!(path.exists());
    }
}
