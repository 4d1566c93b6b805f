//! Fetch-on-miss chunk cache over a remote object.
//!
//! The local cache file has the same length as the remote object. A chunk is
//! fetched from the remote object the first time any byte of it is read,
//! written to the cache file at the same offset, and only then marked
//! present. Concurrent readers of the same missing chunk share one fetch.
//! Failed fetches are not remembered: the chunk stays absent and the next
//! read tries again.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use cinder_common::{CinderError, CinderResult, ResultExt};
use cinder_storage::ObjectStore;
use futures::future::{BoxFuture, FutureExt, Shared, try_join_all};
use parking_lot::Mutex;

use crate::bitmap::Bitmap;
use crate::device::{block_span, check_bounds};
use crate::file::BlockFile;

type Fetch = Shared<BoxFuture<'static, Result<(), Arc<CinderError>>>>;

/// A local cache of fixed-size chunks of one remote object.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn ObjectStore>,
    object: String,
    file: BlockFile,
    size: u64,
    chunk_size: u64,
    present: Bitmap,
    inflight: Mutex<HashMap<u64, Fetch>>,
    fetched: AtomicU64,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("object", &self.object)
            .field("cache", &self.file.path())
            .field("size", &self.size)
            .field("chunk_size", &self.chunk_size)
            .field("present", &self.present.count())
            .finish_non_exhaustive()
    }
}

impl ChunkStore {
    /// Create an empty cache file for `object`, which is `size` bytes long.
    ///
    /// # Errors
    ///
    /// Returns an error if `chunk_size` is zero or the cache file cannot be
    /// created.
    pub async fn create(
        source: Arc<dyn ObjectStore>,
        object: impl Into<String>,
        size: u64,
        chunk_size: u64,
        cache_path: &Path,
    ) -> CinderResult<Self> {
        if chunk_size == 0 {
            return Err(CinderError::Config {
                message: "chunk size must be non-zero".to_string(),
            });
        }

        let object = object.into();
        let file = BlockFile::create(cache_path, size)
            .await
            .with_context(|| format!("creating cache file {}", cache_path.display()))?;

        tracing::debug!(
            object = %object,
            cache = %cache_path.display(),
            size,
            chunk_size,
            "Created chunk cache"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                source,
                object,
                file,
                size,
                chunk_size,
                present: Bitmap::new(size.div_ceil(chunk_size)),
                inflight: Mutex::new(HashMap::new()),
                fetched: AtomicU64::new(0),
            }),
        })
    }

    /// Length of the cached object.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Chunk size in bytes.
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.inner.chunk_size
    }

    /// Remote object path.
    #[must_use]
    pub fn object(&self) -> &str {
        &self.inner.object
    }

    /// Local cache file.
    #[must_use]
    pub fn cache_path(&self) -> &Path {
        self.inner.file.path()
    }

    /// Whether chunk `index` is cached locally.
    #[must_use]
    pub fn is_present(&self, index: u64) -> bool {
        self.inner.present.is_set(index)
    }

    /// Number of chunks cached locally.
    #[must_use]
    pub fn present_chunks(&self) -> u64 {
        self.inner.present.count()
    }

    /// Number of successful remote chunk fetches.
    #[must_use]
    pub fn fetched_chunks(&self) -> u64 {
        self.inner.fetched.load(Ordering::SeqCst)
    }

    /// Read `[offset, offset + length)`, fetching missing chunks first.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds, a chunk cannot be
    /// fetched, or the cache file cannot be read.
    pub async fn read_at(&self, offset: u64, length: u64) -> CinderResult<Bytes> {
        check_bounds(offset, length, self.inner.size)?;
        if length == 0 {
            return Ok(Bytes::new());
        }

        let missing: Vec<u64> = block_span(offset, length, self.inner.chunk_size)
            .filter(|&chunk| !self.inner.present.is_set(chunk))
            .collect();

        if !missing.is_empty() {
            try_join_all(missing.into_iter().map(|chunk| self.ensure_chunk(chunk))).await?;
        }

        self.inner.file.read_at(offset, length).await
    }

    /// Make sure chunk `index` is present, joining an in-flight fetch if any.
    async fn ensure_chunk(&self, index: u64) -> CinderResult<()> {
        let fetch = {
            let mut inflight = self.inner.inflight.lock();
            // A fetch sets the bit before leaving the in-flight table.
            if self.inner.present.is_set(index) {
                return Ok(());
            }
            inflight
                .entry(index)
                .or_insert_with(|| {
                    let inner = Arc::clone(&self.inner);
                    async move {
                        let result = inner.fetch_chunk(index).await.map_err(Arc::new);
                        inner.inflight.lock().remove(&index);
                        result
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        fetch.await.map_err(CinderError::Shared)
    }
}

impl Inner {
    async fn fetch_chunk(&self, index: u64) -> CinderResult<()> {
        let offset = index * self.chunk_size;
        let length = self.chunk_size.min(self.size - offset);

        tracing::trace!(object = %self.object, chunk = index, offset, length, "Fetching chunk");

        let fetch_error = |message: String| CinderError::Fetch {
            object: self.object.clone(),
            chunk: index,
            offset,
            message,
        };

        let data = self
            .source
            .read_range(&self.object, offset, length)
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if data.len() as u64 != length {
            return Err(fetch_error(format!(
                "short read: got {} of {length} bytes",
                data.len()
            )));
        }

        self.file
            .write_at(offset, data)
            .await
            .map_err(|e| fetch_error(format!("writing cache: {e}")))?;

        self.present.set(index);
        self.fetched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_storage::MemoryBucket;
    use std::time::Duration;

    fn pattern(len: usize) -> Vec<u8> {
        #[allow(clippy::cast_possible_truncation)]
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn store(bucket: Arc<MemoryBucket>, chunk_size: u64) -> (tempfile::TempDir, ChunkStore) {
        let temp = tempfile::tempdir().unwrap();
        let size = bucket.get("obj").unwrap().len() as u64;
        let store = ChunkStore::create(bucket, "obj", size, chunk_size, &temp.path().join("cache"))
            .await
            .unwrap();
        (temp, store)
    }

    #[tokio::test]
    async fn fetches_only_missing_chunks() {
        let bucket = Arc::new(MemoryBucket::new().with_object("obj", pattern(4 * 4096)));
        let (_temp, store) = store(bucket.clone(), 4096).await;

        store.read_at(4096, 10).await.unwrap();
        assert_eq!(bucket.range_reads(), 1);

        // Spans chunks 1..=2; chunk 1 is already present.
        store.read_at(8000, 500).await.unwrap();
        assert_eq!(bucket.range_reads(), 2);
        assert_eq!(bucket.read_log()[1], ("obj".to_string(), 8192, 4096));
        assert_eq!(store.present_chunks(), 2);
    }

    #[tokio::test]
    async fn last_chunk_is_short() {
        let data = pattern(4096 + 100);
        let bucket = Arc::new(MemoryBucket::new().with_object("obj", data.clone()));
        let (_temp, store) = store(bucket.clone(), 4096).await;

        let tail = store.read_at(4096, 100).await.unwrap();
        assert_eq!(tail.as_ref(), &data[4096..]);
        assert_eq!(bucket.read_log()[0], ("obj".to_string(), 4096, 100));
    }

    #[tokio::test]
    async fn out_of_bounds_is_rejected() {
        let bucket = Arc::new(MemoryBucket::new().with_object("obj", pattern(4096)));
        let (_temp, store) = store(bucket.clone(), 4096).await;

        assert!(matches!(
            store.read_at(4000, 200).await,
            Err(CinderError::OutOfBounds { .. })
        ));
        assert_eq!(bucket.range_reads(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_fetch() {
        let bucket = Arc::new(
            MemoryBucket::new()
                .with_object("obj", pattern(2 * 4096))
                .with_latency(Duration::from_millis(50)),
        );
        let (_temp, store) = store(bucket.clone(), 4096).await;

        let readers = (0..16).map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.read_at(i * 16, 16).await })
        });
        for reader in readers {
            reader.await.unwrap().unwrap();
        }

        assert_eq!(bucket.range_reads(), 1);
        assert_eq!(store.fetched_chunks(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_retried_by_next_read() {
        let data = pattern(4096);
        let bucket = Arc::new(MemoryBucket::new().with_object("obj", data.clone()));
        let (_temp, store) = store(bucket.clone(), 4096).await;

        bucket.fail_next_reads(1);
        let err = store.read_at(0, 16).await.unwrap_err();
        assert!(err.to_string().contains("chunk 0"));
        assert!(!store.is_present(0));

        let bytes = store.read_at(0, 16).await.unwrap();
        assert_eq!(bytes.as_ref(), &data[..16]);
        assert!(store.is_present(0));
        assert_eq!(bucket.range_reads(), 2);
    }

    #[tokio::test]
    async fn concurrent_waiters_share_failure() {
        let bucket = Arc::new(
            MemoryBucket::new()
                .with_object("obj", pattern(4096))
                .with_latency(Duration::from_millis(20)),
        );
        let (_temp, store) = store(bucket.clone(), 4096).await;
        bucket.fail_next_reads(1);

        let (a, b) = tokio::join!(store.read_at(0, 8), store.read_at(8, 8));
        assert!(a.is_err());
        assert!(b.is_err());
        assert_eq!(bucket.range_reads(), 1);
    }

    #[tokio::test]
    async fn zero_chunk_size_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(MemoryBucket::new());
        let err = ChunkStore::create(bucket, "obj", 10, 0, &temp.path().join("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, CinderError::Config { .. }));
    }
}
