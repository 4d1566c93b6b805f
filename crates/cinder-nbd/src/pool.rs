//! Bounded pool of kernel NBD device slots.
//!
//! Allocation never waits: when every slot is taken the caller gets
//! [`CinderError::NoFreeSlots`] straight away. Release refuses slots the
//! kernel still uses with [`CinderError::DeviceInUse`], which callers retry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cinder_common::{CinderError, CinderResult, NbdConfig};
use parking_lot::Mutex;

use crate::path::block_name;

/// Where the kernel advertises how many NBD devices it created.
pub const NBDS_MAX_PARAMETER: &str = "/sys/module/nbd/parameters/nbds_max";

/// Allocation of NBD slots.
pub trait SlotPool: Send + Sync + fmt::Debug {
    /// Take a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`CinderError::NoFreeSlots`] when the pool is exhausted.
    fn allocate(&self) -> CinderResult<u32>;

    /// Return a slot to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`CinderError::DeviceInUse`] while the kernel holds the
    /// device, or [`CinderError::SlotNotAllocated`] for a free slot.
    fn release(&self, slot: u32) -> CinderResult<()>;

    /// Number of slots.
    fn capacity(&self) -> u32;
}

/// Whether the kernel is using an NBD device.
pub trait SlotProbe: Send + Sync + fmt::Debug {
    /// Whether `slot` is attached to a server.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel state cannot be inspected.
    fn in_use(&self, slot: u32) -> CinderResult<bool>;
}

/// Reads device state from sysfs: a connected device exposes
/// `/sys/block/nbdN/pid`.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    sys_block_dir: PathBuf,
}

impl SysfsProbe {
    /// Probe devices under `sys_block_dir` (normally `/sys/block`).
    pub fn new(sys_block_dir: impl Into<PathBuf>) -> Self {
        Self {
            sys_block_dir: sys_block_dir.into(),
        }
    }

    /// The pid file of `slot`.
    #[must_use]
    pub fn pid_file(&self, slot: u32) -> PathBuf {
        self.sys_block_dir.join(block_name(slot)).join("pid")
    }
}

impl SlotProbe for SysfsProbe {
    fn in_use(&self, slot: u32) -> CinderResult<bool> {
        match std::fs::metadata(self.pid_file(slot)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CinderError::Nbd {
                message: format!("failed to inspect nbd{slot}: {e}"),
            }),
        }
    }
}

/// A fixed set of slots guarded by one mutex.
pub struct DevicePool {
    allocated: Mutex<Vec<bool>>,
    probe: Arc<dyn SlotProbe>,
}

impl fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocated = self.allocated.lock();
        f.debug_struct("DevicePool")
            .field("capacity", &allocated.len())
            .field("allocated", &allocated.iter().filter(|a| **a).count())
            .field("probe", &self.probe)
            .finish()
    }
}

impl DevicePool {
    /// A pool of `capacity` slots.
    pub fn new(capacity: u32, probe: Arc<dyn SlotProbe>) -> Self {
        Self {
            allocated: Mutex::new(vec![false; capacity as usize]),
            probe,
        }
    }

    /// A pool probed as configured, sized to the configured pool size or
    /// the number of devices the kernel created, whichever is smaller.
    #[must_use]
    pub fn from_config(config: &NbdConfig) -> Self {
        let capacity = pool_capacity(config, kernel_pool_capacity().ok());
        tracing::debug!(
            configured = config.pool_size,
            capacity,
            "Sizing NBD device pool"
        );
        Self::new(capacity, Arc::new(SysfsProbe::new(&config.sys_block_dir)))
    }

    /// Number of allocated slots.
    #[must_use]
    pub fn allocated(&self) -> u32 {
        let count = self.allocated.lock().iter().filter(|a| **a).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

impl SlotPool for DevicePool {
    fn allocate(&self) -> CinderResult<u32> {
        let mut allocated = self.allocated.lock();

        for (index, taken) in allocated.iter_mut().enumerate() {
            if *taken {
                continue;
            }
            let slot = u32::try_from(index).map_err(|_| CinderError::Internal {
                message: format!("slot index {index} out of range"),
            })?;

            // Skip devices some other process left attached.
            if self.probe.in_use(slot)? {
                tracing::debug!(slot, "NBD device busy outside the pool, skipping");
                continue;
            }

            *taken = true;
            tracing::debug!(slot, "Allocated NBD slot");
            return Ok(slot);
        }

        Err(CinderError::NoFreeSlots {
            capacity: u32::try_from(allocated.len()).unwrap_or(u32::MAX),
        })
    }

    fn release(&self, slot: u32) -> CinderResult<()> {
        let mut allocated = self.allocated.lock();

        let taken = allocated
            .get_mut(slot as usize)
            .filter(|taken| **taken)
            .ok_or(CinderError::SlotNotAllocated { slot })?;

        if self.probe.in_use(slot)? {
            return Err(CinderError::DeviceInUse { slot });
        }

        *taken = false;
        tracing::debug!(slot, "Released NBD slot");
        Ok(())
    }

    fn capacity(&self) -> u32 {
        u32::try_from(self.allocated.lock().len()).unwrap_or(u32::MAX)
    }
}

/// Usable pool size: the configured size, clamped to the kernel's device
/// count when it is known.
#[must_use]
pub fn pool_capacity(config: &NbdConfig, kernel: Option<u32>) -> u32 {
    kernel.map_or(config.pool_size, |kernel| kernel.min(config.pool_size))
}

/// Number of NBD devices the kernel module created.
///
/// # Errors
///
/// Returns an error if the nbd module is not loaded or the parameter is
/// unreadable.
pub fn kernel_pool_capacity() -> CinderResult<u32> {
    read_capacity(Path::new(NBDS_MAX_PARAMETER))
}

fn read_capacity(parameter: &Path) -> CinderResult<u32> {
    let content = std::fs::read_to_string(parameter).map_err(|e| CinderError::Nbd {
        message: format!(
            "cannot read {} (is the nbd module loaded?): {e}",
            parameter.display()
        ),
    })?;

    content.trim().parse().map_err(|e| CinderError::Nbd {
        message: format!("invalid nbds_max {:?}: {e}", content.trim()),
    })
}
