//! Copy-on-write root filesystems exported over NBD.
//!
//! A [`CowDevice`] goes through three states: constructed, started (the
//! overlay is exported and its device path is known) and closed (export
//! torn down, overlay closed, NBD slot back in the pool).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cinder_block::{Cache, Device, Overlay, ReadonlyDevice};
use cinder_common::{CinderError, CinderResult, NbdConfig, ReleasePolicy, ResultExt, SetOnce};
use cinder_nbd::{DirectPathMount, NbdDriver, SlotPool, device_path_in, device_slot};

/// A sandbox's private, writable view of a shared read-only device,
/// exported as a kernel block device.
#[derive(Debug)]
pub struct CowDevice {
    overlay: Arc<Overlay>,
    mount: DirectPathMount,
    pool: Arc<dyn SlotPool>,
    dev_dir: PathBuf,
    release: ReleasePolicy,
    ready: SetOnce<PathBuf>,
    closed: AtomicBool,
}

impl CowDevice {
    /// Layer a new write cache at `cache_path` over `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cache cannot be created.
    pub async fn new(
        base: Arc<dyn ReadonlyDevice>,
        cache_path: impl AsRef<Path>,
        block_size: u64,
        pool: Arc<dyn SlotPool>,
        driver: Arc<dyn NbdDriver>,
        nbd: &NbdConfig,
    ) -> CinderResult<Self> {
        let cache_path = cache_path.as_ref();
        let cache = Cache::new(base.size(), block_size, cache_path)
            .await
            .with_context(|| format!("creating overlay cache {}", cache_path.display()))?;
        let overlay = Arc::new(Overlay::new(base, Arc::new(cache), block_size)?);

        let mount = DirectPathMount::new(
            Arc::clone(&overlay) as Arc<dyn Device>,
            Arc::clone(&pool),
            driver,
        )
        .with_connect_timeout(nbd.connect_timeout());

        Ok(Self {
            overlay,
            mount,
            pool,
            dev_dir: nbd.dev_dir.clone(),
            release: ReleasePolicy::default(),
            ready: SetOnce::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// How busy slot releases are retried on close.
    #[must_use]
    pub fn with_release_policy(mut self, release: ReleasePolicy) -> Self {
        self.release = release;
        self
    }

    /// The overlay being exported.
    #[must_use]
    pub const fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    /// Export the overlay and resolve the device path.
    ///
    /// # Errors
    ///
    /// Returns an error if the export fails or the device was already
    /// started.
    pub async fn start(&self) -> CinderResult<PathBuf> {
        let stored = match self.mount.open().await {
            Ok(slot) => {
                let path = device_path_in(&self.dev_dir, slot);
                tracing::info!(slot, path = %path.display(), "Copy-on-write device started");
                self.ready.set_value(path)
            }
            Err(e) => self.ready.set_error(e.context("exporting overlay")),
        };
        stored?;

        self.ready.wait().await
    }

    /// The exported device path. Waits until the device is started.
    ///
    /// # Errors
    ///
    /// Returns the start error if the export failed.
    pub async fn path(&self) -> CinderResult<PathBuf> {
        self.ready.wait().await
    }

    /// Copy the current contents of the exported device to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is not started or the copy fails.
    pub async fn export(&self, target: &Path) -> CinderResult<()> {
        let path = self.path().await?;
        self.overlay.flush().await?;

        let copied = tokio::fs::copy(&path, target)
            .await
            .with_context(|| format!("copying {} to {}", path.display(), target.display()))?;

        tracing::info!(
            source = %path.display(),
            target = %target.display(),
            bytes = copied,
            "Exported copy-on-write device"
        );
        Ok(())
    }

    /// Tear the device down: close the export and the overlay, then return
    /// the NBD slot, retrying while the kernel still holds the device.
    ///
    /// A device whose start failed has no slot to return. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns every failure, joined. Closing a device that was never
    /// started is an error.
    pub async fn close(&self) -> CinderResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = Vec::new();

        if let Err(e) = self.mount.close().await {
            errors.push(e.context("closing NBD export"));
        }
        if let Err(e) = self.overlay.close().await {
            errors.push(e.context("closing overlay"));
        }

        match self.ready.get() {
            Some(Ok(path)) => match device_slot(&path) {
                Ok(slot) => {
                    if let Err(e) = self.release_slot(slot).await {
                        errors.push(e);
                    }
                }
                Err(e) => errors.push(e),
            },
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Closing copy-on-write device that never started");
            }
            None => errors.push(CinderError::Nbd {
                message: "device path was never resolved".to_string(),
            }),
        }

        CinderError::join(errors)
    }

    async fn release_slot(&self, slot: u32) -> CinderResult<()> {
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);

            let err = match self.pool.release(slot) {
                Ok(()) => {
                    tracing::debug!(slot, attempts, "Released NBD slot");
                    return Ok(());
                }
                Err(e) if e.is_device_in_use() => e,
                Err(e) => return Err(e.context(format!("releasing nbd{slot}"))),
            };

            if !self.release.allows_retry(attempts) {
                return Err(err.context(format!("giving up on nbd{slot} after {attempts} attempts")));
            }

            if self.release.log_every > 0 && attempts % self.release.log_every == 0 {
                tracing::warn!(slot, attempt = attempts, "NBD device still in use, retrying release");
            }

            let interval = self.release.interval();
            if interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cinder_nbd::{DevicePool, NbdConnection, SlotProbe};
    use std::sync::atomic::AtomicU32;

    /// Hands out slot 5 and reports it busy for the first `busy` releases.
    #[derive(Debug)]
    struct BusyPool {
        busy: u32,
        releases: AtomicU32,
        allocated: AtomicBool,
    }

    impl BusyPool {
        fn new(busy: u32) -> Arc<Self> {
            Arc::new(Self {
                busy,
                releases: AtomicU32::new(0),
                allocated: AtomicBool::new(false),
            })
        }
    }

    impl SlotPool for BusyPool {
        fn allocate(&self) -> CinderResult<u32> {
            if self.allocated.swap(true, Ordering::SeqCst) {
                return Err(CinderError::NoFreeSlots { capacity: 1 });
            }
            Ok(5)
        }

        fn release(&self, slot: u32) -> CinderResult<()> {
            let attempt = self.releases.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.busy {
                return Err(CinderError::DeviceInUse { slot });
            }
            self.allocated.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn capacity(&self) -> u32 {
            1
        }
    }

    #[derive(Debug)]
    struct LoopbackDriver;

    #[derive(Debug)]
    struct LoopbackConnection(u32);

    #[async_trait]
    impl NbdConnection for LoopbackConnection {
        fn slot(&self) -> u32 {
            self.0
        }

        async fn disconnect(&mut self) -> CinderResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl NbdDriver for LoopbackDriver {
        async fn connect(&self, slot: u32, _device: Arc<dyn Device>) -> CinderResult<Box<dyn NbdConnection>> {
            Ok(Box::new(LoopbackConnection(slot)))
        }
    }

    #[derive(Debug)]
    struct IdleProbe;

    impl SlotProbe for IdleProbe {
        fn in_use(&self, _slot: u32) -> CinderResult<bool> {
            Ok(false)
        }
    }

    async fn cow(dir: &Path, pool: Arc<dyn SlotPool>) -> CowDevice {
        let base = Arc::new(Cache::new(8192, 4096, dir.join("base")).await.unwrap());
        base.write_at(0, vec![9u8; 8192].into()).await.unwrap();

        CowDevice::new(
            base,
            dir.join("rootfs.cow"),
            4096,
            pool,
            Arc::new(LoopbackDriver),
            &NbdConfig::default(),
        )
        .await
        .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn close_retries_busy_release() {
        let temp = tempfile::tempdir().unwrap();
        let pool = BusyPool::new(250);
        let device = cow(temp.path(), pool.clone()).await;

        assert_eq!(device.start().await.unwrap(), PathBuf::from("/dev/nbd5"));
        assert_eq!(device.path().await.unwrap(), PathBuf::from("/dev/nbd5"));

        device.close().await.unwrap();
        assert_eq!(pool.releases.load(Ordering::SeqCst), 251);
        assert!(!pool.allocated.load(Ordering::SeqCst));

        // Closing again does not release again.
        device.close().await.unwrap();
        assert_eq!(pool.releases.load(Ordering::SeqCst), 251);
    }

    #[tokio::test]
    async fn bounded_release_gives_up() {
        let temp = tempfile::tempdir().unwrap();
        let pool = BusyPool::new(u32::MAX);
        let device = cow(temp.path(), pool.clone())
            .await
            .with_release_policy(ReleasePolicy::bounded(3));

        device.start().await.unwrap();
        let err = device.close().await.unwrap_err();

        assert!(err.is_device_in_use());
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(pool.releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn close_before_start_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let pool = BusyPool::new(0);
        let device = cow(temp.path(), pool.clone()).await;

        let err = device.close().await.unwrap_err();
        assert!(err.to_string().contains("never resolved"));
        assert_eq!(pool.releases.load(Ordering::SeqCst), 0);
        assert!(!temp.path().join("rootfs.cow").exists());
    }

    #[tokio::test]
    async fn failed_start_is_shared_and_closes_cleanly() {
        let temp = tempfile::tempdir().unwrap();
        let pool = Arc::new(DevicePool::new(0, Arc::new(IdleProbe)));
        let device = cow(temp.path(), pool).await;

        let err = device.start().await.unwrap_err();
        assert!(err.to_string().contains("No free NBD slots"));
        assert!(device.path().await.is_err());

        device.close().await.unwrap();
    }

    #[tokio::test]
    async fn second_start_fails() {
        let temp = tempfile::tempdir().unwrap();
        let pool = Arc::new(DevicePool::new(2, Arc::new(IdleProbe)));
        let device = cow(temp.path(), pool.clone()).await;

        device.start().await.unwrap();
        assert!(device.start().await.is_err());

        device.close().await.unwrap();
        assert_eq!(pool.allocated(), 0);
    }

    #[tokio::test]
    async fn writes_stay_in_the_overlay() {
        let temp = tempfile::tempdir().unwrap();
        let device = cow(temp.path(), BusyPool::new(0)).await;

        device.overlay().write_at(4096, vec![1u8; 512].into()).await.unwrap();
        assert_eq!(device.overlay().read_at(4096, 4).await.unwrap().as_ref(), &[1u8; 4]);
        assert_eq!(device.overlay().read_at(0, 4).await.unwrap().as_ref(), &[9u8; 4]);
    }
}
