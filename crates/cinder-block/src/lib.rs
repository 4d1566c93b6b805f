//! # cinder-block
//!
//! Block devices for Cinder sandboxes.
//!
//! This crate provides:
//! - [`ChunkStore`]: a local, fetch-on-miss chunk cache of a remote object
//! - [`RemoteDevice`]: a read-only device over a [`ChunkStore`]
//! - [`Cache`]: a local block write cache
//! - [`Overlay`]: a copy-on-write device layering a [`Cache`] over a base
//! - [`DeviceLease`]: a closable handle on a shared device

#![warn(missing_docs)]

pub mod bitmap;
pub mod cache;
pub mod chunk;
pub mod device;
mod file;
pub mod lease;
pub mod overlay;
pub mod remote;

pub use cache::Cache;
pub use chunk::ChunkStore;
pub use device::{Device, ReadonlyDevice};
pub use lease::{DeviceLease, LeaseCounter};
pub use overlay::Overlay;
pub use remote::RemoteDevice;

/// Standard page size; chunk size of memory snapshots.
pub const PAGE_SIZE: u64 = 2 << 11;

/// Huge page size; chunk size of memory snapshots of huge-paged templates.
pub const HUGEPAGE_SIZE: u64 = 2 << 20;

/// Fetch granularity of root filesystem images.
pub const ROOTFS_CHUNK_SIZE: u64 = 4 << 20;

/// Overlay block size of sandbox root filesystems.
pub const ROOTFS_BLOCK_SIZE: u64 = 2 << 11;
