//! Exposing a device as a kernel block device.

use std::sync::Arc;
use std::time::Duration;

use cinder_block::Device;
use cinder_common::{CinderError, CinderResult};
use tokio::sync::Mutex;

use crate::driver::{NbdConnection, NbdDriver};
use crate::pool::SlotPool;

/// Returns an allocated slot to the pool unless disarmed.
struct SlotGuard {
    pool: Arc<dyn SlotPool>,
    slot: u32,
    armed: bool,
}

impl SlotGuard {
    fn disarm(mut self) -> u32 {
        self.armed = false;
        self.slot
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.pool.release(self.slot) {
            tracing::warn!(slot = self.slot, error = %e, "Failed to return NBD slot after aborted open");
        }
    }
}

/// A device exported through an NBD slot taken from a pool.
///
/// Closing tears the export down but keeps the slot allocated; the owner
/// releases it once the kernel lets go of the device.
#[derive(Debug)]
pub struct DirectPathMount {
    device: Arc<dyn Device>,
    pool: Arc<dyn SlotPool>,
    driver: Arc<dyn NbdDriver>,
    connect_timeout: Duration,
    connection: Mutex<Option<Box<dyn NbdConnection>>>,
}

impl DirectPathMount {
    /// Prepare an export of `device`.
    pub fn new(device: Arc<dyn Device>, pool: Arc<dyn SlotPool>, driver: Arc<dyn NbdDriver>) -> Self {
        Self {
            device,
            pool,
            driver,
            connect_timeout: Duration::from_secs(10),
            connection: Mutex::new(None),
        }
    }

    /// How long `open` waits for the export to go live.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Allocate a slot and export the device on it.
    ///
    /// If the export fails, times out or the future is dropped, the slot is
    /// returned to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if no slot is free, the mount is already open, or
    /// the driver cannot attach the device.
    pub async fn open(&self) -> CinderResult<u32> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Err(CinderError::Nbd {
                message: "mount is already open".to_string(),
            });
        }

        let guard = SlotGuard {
            pool: Arc::clone(&self.pool),
            slot: self.pool.allocate()?,
            armed: true,
        };
        let slot = guard.slot;

        tracing::debug!(slot, size = self.device.size(), "Opening NBD export");

        let connected = tokio::time::timeout(
            self.connect_timeout,
            self.driver.connect(slot, Arc::clone(&self.device)),
        )
        .await
        .map_err(|_| CinderError::Nbd {
            message: format!(
                "timed out after {:?} waiting for nbd{slot} to come up",
                self.connect_timeout
            ),
        })??;

        *connection = Some(connected);
        let slot = guard.disarm();

        tracing::info!(slot, "NBD export is live");
        Ok(slot)
    }

    /// Tear down the export. Closing an unopened or closed mount succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver fails to disconnect.
    pub async fn close(&self) -> CinderResult<()> {
        let connection = self.connection.lock().await.take();
        match connection {
            Some(mut connection) => {
                let slot = connection.slot();
                connection.disconnect().await?;
                tracing::debug!(slot, "NBD export closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
