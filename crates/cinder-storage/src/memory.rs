//! In-memory bucket.
//!
//! Counts every request it serves and can inject latency or failures, which
//! makes it the remote source of choice for exercising fetch behaviour.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cinder_common::{CinderError, CinderResult};
use parking_lot::Mutex;

use crate::store::ObjectStore;

/// A bucket held in memory.
#[derive(Debug, Default)]
pub struct MemoryBucket {
    objects: Mutex<HashMap<String, Bytes>>,
    reads: Mutex<Vec<(String, u64, u64)>>,
    range_reads: AtomicU64,
    size_lookups: AtomicU64,
    failing_reads: AtomicU32,
    latency: Mutex<Option<Duration>>,
}

impl MemoryBucket {
    /// Create an empty bucket.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an object.
    #[must_use]
    pub fn with_object(self, path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert(path, data);
        self
    }

    /// Delay every range read by `latency`.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    /// Add or replace an object.
    pub fn insert(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.lock().insert(path.into(), data.into());
    }

    /// Contents of an object, if present.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.lock().get(path).cloned()
    }

    /// Make the next `count` range reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Range reads served (including failed ones).
    #[must_use]
    pub fn range_reads(&self) -> u64 {
        self.range_reads.load(Ordering::SeqCst)
    }

    /// Length lookups served.
    #[must_use]
    pub fn size_lookups(&self) -> u64 {
        self.size_lookups.load(Ordering::SeqCst)
    }

    /// Every range read as `(path, offset, length)`, in arrival order.
    #[must_use]
    pub fn read_log(&self) -> Vec<(String, u64, u64)> {
        self.reads.lock().clone()
    }

    fn take_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for MemoryBucket {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn size(&self, path: &str) -> CinderResult<u64> {
        self.size_lookups.fetch_add(1, Ordering::SeqCst);
        self.get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| CinderError::ObjectNotFound {
                object: path.to_string(),
            })
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> CinderResult<Bytes> {
        self.range_reads.fetch_add(1, Ordering::SeqCst);
        self.reads.lock().push((path.to_string(), offset, length));

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.take_failure() {
            return Err(CinderError::Storage {
                object: path.to_string(),
                message: "injected read failure".to_string(),
            });
        }

        let data = self.get(path).ok_or_else(|| CinderError::ObjectNotFound {
            object: path.to_string(),
        })?;

        let len = data.len() as u64;
        let start = offset.min(len);
        let end = offset.saturating_add(length).min(len);
        #[allow(clippy::cast_possible_truncation)]
        Ok(data.slice(start as usize..end as usize))
    }

    async fn write(&self, path: &str, data: Bytes) -> CinderResult<()> {
        self.insert(path, data);
        Ok(())
    }

    async fn upload(&self, path: &str, source: &Path) -> CinderResult<()> {
        let data = tokio::fs::read(source).await?;
        self.insert(path, data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> CinderResult<()> {
        self.objects.lock().remove(path);
        Ok(())
    }
}
