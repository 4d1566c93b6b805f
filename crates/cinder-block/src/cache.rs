//! Local write cache.
//!
//! A sparse file plus a bitmap of blocks that hold written data. Blocks that
//! were never written are not readable: the cache has no data for them.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use cinder_common::{CinderError, CinderResult, ResultExt};

use crate::bitmap::Bitmap;
use crate::device::{Device, ReadonlyDevice, block_span, check_bounds};
use crate::file::BlockFile;

/// A block-granular write cache stored in a local file.
#[derive(Debug)]
pub struct Cache {
    file: BlockFile,
    size: u64,
    block_size: u64,
    dirty: Bitmap,
    closed: AtomicBool,
}

impl Cache {
    /// Create an empty cache of `size` bytes at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if `block_size` is zero or the file cannot be created.
    pub async fn new(size: u64, block_size: u64, path: impl AsRef<Path>) -> CinderResult<Self> {
        if block_size == 0 {
            return Err(CinderError::Config {
                message: "block size must be non-zero".to_string(),
            });
        }

        let path = path.as_ref();
        let file = BlockFile::create(path, size)
            .await
            .with_context(|| format!("creating write cache {}", path.display()))?;

        Ok(Self {
            file,
            size,
            block_size,
            dirty: Bitmap::new(size.div_ceil(block_size)),
            closed: AtomicBool::new(false),
        })
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Whether every block touched by the range holds written data.
    #[must_use]
    pub fn is_cached(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        self.dirty.all_set(block_span(offset, length, self.block_size))
    }

    /// Whether block `index` holds written data.
    #[must_use]
    pub fn is_dirty(&self, index: u64) -> bool {
        self.dirty.is_set(index)
    }

    /// Number of blocks holding written data.
    #[must_use]
    pub fn dirty_blocks(&self) -> u64 {
        self.dirty.count()
    }

    fn ensure_open(&self) -> CinderResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CinderError::DeviceClosed {
                device: self.file.path().display().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReadonlyDevice for Cache {
    async fn read_at(&self, offset: u64, length: u64) -> CinderResult<Bytes> {
        self.ensure_open()?;
        check_bounds(offset, length, self.size)?;
        if length == 0 {
            return Ok(Bytes::new());
        }

        if let Some(missing) = block_span(offset, length, self.block_size).find(|&b| !self.dirty.is_set(b)) {
            return Err(CinderError::BytesNotAvailable {
                offset: missing * self.block_size,
            });
        }

        self.file.read_at(offset, length).await
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    async fn close(&self) -> CinderResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.file
            .remove()
            .await
            .with_context(|| format!("removing write cache {}", self.file.path().display()))
    }
}

#[async_trait]
impl Device for Cache {
    /// Blocks are marked written only when the write covers them entirely
    /// (or reaches the end of the device).
    async fn write_at(&self, offset: u64, data: Bytes) -> CinderResult<()> {
        self.ensure_open()?;
        let length = data.len() as u64;
        check_bounds(offset, length, self.size)?;
        if length == 0 {
            return Ok(());
        }

        self.file.write_at(offset, data).await?;

        let end = offset + length;
        for block in block_span(offset, length, self.block_size) {
            let start = block * self.block_size;
            let block_end = (start + self.block_size).min(self.size);
            if offset <= start && end >= block_end {
                self.dirty.set(block);
            }
        }
        Ok(())
    }

    async fn flush(&self) -> CinderResult<()> {
        self.ensure_open()?;
        self.file.sync().await
    }
}
