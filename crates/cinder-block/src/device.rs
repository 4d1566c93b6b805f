//! Block device contracts.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cinder_common::{CinderError, CinderResult};

/// A fixed-size device that can be read at any byte offset.
#[async_trait]
pub trait ReadonlyDevice: Send + Sync + fmt::Debug {
    /// Read `length` bytes starting at `offset`.
    ///
    /// The range must lie within [`size`](Self::size).
    async fn read_at(&self, offset: u64, length: u64) -> CinderResult<Bytes>;

    /// Logical size in bytes.
    fn size(&self) -> u64;

    /// Alignment unit of the device.
    fn block_size(&self) -> u64;

    /// Release the device's resources. Later reads fail.
    async fn close(&self) -> CinderResult<()>;
}

/// A device that also accepts writes.
#[async_trait]
pub trait Device: ReadonlyDevice {
    /// Write `data` at `offset`. The range must lie within the device.
    async fn write_at(&self, offset: u64, data: Bytes) -> CinderResult<()>;

    /// Make completed writes durable.
    async fn flush(&self) -> CinderResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: ReadonlyDevice + ?Sized> ReadonlyDevice for Arc<T> {
    async fn read_at(&self, offset: u64, length: u64) -> CinderResult<Bytes> {
        (**self).read_at(offset, length).await
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn block_size(&self) -> u64 {
        (**self).block_size()
    }

    async fn close(&self) -> CinderResult<()> {
        (**self).close().await
    }
}

/// Reject ranges that extend past `size`.
///
/// # Errors
///
/// Returns [`CinderError::OutOfBounds`] for ranges outside the device.
pub fn check_bounds(offset: u64, length: u64, size: u64) -> CinderResult<()> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(CinderError::OutOfBounds {
            offset,
            length,
            size,
        }),
    }
}

/// Indices of the blocks of `block_size` touched by `[offset, offset + length)`.
///
/// `length` must be non-zero.
#[must_use]
pub const fn block_span(offset: u64, length: u64, block_size: u64) -> std::ops::RangeInclusive<u64> {
    (offset / block_size)..=((offset + length - 1) / block_size)
}
