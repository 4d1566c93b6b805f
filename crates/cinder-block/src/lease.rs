//! Per-user handles on shared devices.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use cinder_common::{CinderError, CinderResult};
use tokio::sync::watch;

use crate::device::ReadonlyDevice;

/// A handle on a shared read-only device.
///
/// Closing the lease only ends this holder's access; the shared device stays
/// open for everyone else and is closed by its owner. A lease handed out by a
/// [`LeaseCounter`] is counted until it is closed or dropped.
#[derive(Debug)]
pub struct DeviceLease {
    device: Arc<dyn ReadonlyDevice>,
    released: AtomicBool,
    counter: Option<LeaseCounter>,
}

impl DeviceLease {
    /// Lease `device` without tracking.
    pub fn new(device: Arc<dyn ReadonlyDevice>) -> Self {
        Self {
            device,
            released: AtomicBool::new(false),
            counter: None,
        }
    }

    /// Whether the lease has been closed.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn end(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(counter) = &self.counter {
            counter.active.send_modify(|active| *active = active.saturating_sub(1));
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.end();
    }
}

#[async_trait]
impl ReadonlyDevice for DeviceLease {
    async fn read_at(&self, offset: u64, length: u64) -> CinderResult<Bytes> {
        if self.is_released() {
            return Err(CinderError::DeviceClosed {
                device: "device lease".to_string(),
            });
        }
        self.device.read_at(offset, length).await
    }

    fn size(&self) -> u64 {
        self.device.size()
    }

    fn block_size(&self) -> u64 {
        self.device.block_size()
    }

    async fn close(&self) -> CinderResult<()> {
        self.end();
        Ok(())
    }
}

/// Counts the outstanding leases on devices owned by one holder, so the
/// owner can wait for every user to let go before closing them.
#[derive(Debug, Clone)]
pub struct LeaseCounter {
    active: Arc<watch::Sender<usize>>,
}

impl LeaseCounter {
    /// A counter with no leases.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { active: Arc::new(tx) }
    }

    /// Lease `device`, counting the lease until it ends.
    pub fn lease(&self, device: Arc<dyn ReadonlyDevice>) -> DeviceLease {
        self.active.send_modify(|active| *active += 1);
        DeviceLease {
            device,
            released: AtomicBool::new(false),
            counter: Some(self.clone()),
        }
    }

    /// Number of leases not yet ended.
    #[must_use]
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until every lease has ended.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|active| *active == 0).await;
    }
}

impl Default for LeaseCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteDevice;
    use cinder_storage::MemoryBucket;

    #[tokio::test]
    async fn closing_lease_leaves_device_open() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(MemoryBucket::new().with_object("obj", vec![5u8; 4096]));
        let shared: Arc<dyn ReadonlyDevice> = Arc::new(
            RemoteDevice::open(bucket, "obj", 4096, temp.path().join("cache"))
                .await
                .unwrap(),
        );

        let lease = DeviceLease::new(Arc::clone(&shared));
        assert_eq!(lease.read_at(0, 2).await.unwrap().as_ref(), &[5, 5]);

        lease.close().await.unwrap();
        assert!(lease.read_at(0, 2).await.is_err());
        assert_eq!(shared.read_at(0, 2).await.unwrap().as_ref(), &[5, 5]);
    }

    #[tokio::test]
    async fn counter_tracks_closed_and_dropped_leases() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(MemoryBucket::new().with_object("obj", vec![5u8; 4096]));
        let shared: Arc<dyn ReadonlyDevice> = Arc::new(
            RemoteDevice::open(bucket, "obj", 4096, temp.path().join("cache"))
                .await
                .unwrap(),
        );

        let counter = LeaseCounter::new();
        let closed = counter.lease(Arc::clone(&shared));
        let dropped = counter.lease(Arc::clone(&shared));
        assert_eq!(counter.active(), 2);

        closed.close().await.unwrap();
        closed.close().await.unwrap();
        assert_eq!(counter.active(), 1);

        let waiter = tokio::spawn({
            let counter = counter.clone();
            async move { counter.wait_idle().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(dropped);
        waiter.await.unwrap();
        assert_eq!(counter.active(), 0);
    }
}
