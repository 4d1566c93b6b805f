//! # cinder-nbd
//!
//! Kernel NBD plumbing for Cinder sandboxes.
//!
//! This crate provides:
//! - [`DevicePool`]: bounded allocation of `/dev/nbdN` slots
//! - [`DirectPathMount`]: exporting a [`cinder_block::Device`] on a pooled slot
//! - [`KernelDriver`]: the Linux driver behind a mount
//! - [`protocol`]: the NBD transmission phase, served in-process

#![warn(missing_docs)]

pub mod driver;
pub mod kernel;
pub mod mount;
pub mod path;
pub mod pool;
pub mod protocol;

pub use driver::{NbdConnection, NbdDriver};
pub use kernel::{KernelConnection, KernelDriver};
pub use mount::DirectPathMount;
pub use path::{device_path, device_path_in, device_slot};
pub use pool::{DevicePool, SlotPool, SlotProbe, SysfsProbe, kernel_pool_capacity, pool_capacity};
