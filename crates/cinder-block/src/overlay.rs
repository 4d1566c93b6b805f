//! Copy-on-write overlay device.
//!
//! Reads are served block by block from the write cache when the block has
//! been written, and from the read-only base otherwise. Writes only ever go
//! to the cache, so the base is never modified.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use cinder_common::{CinderError, CinderResult};
use tokio::sync::Mutex;

use crate::cache::Cache;
use crate::device::{Device, ReadonlyDevice, check_bounds};

/// A private writable view over a shared read-only device.
#[derive(Debug)]
pub struct Overlay {
    base: Arc<dyn ReadonlyDevice>,
    cache: Arc<Cache>,
    block_size: u64,
    write_lock: Mutex<()>,
}

impl Overlay {
    /// Layer `cache` over `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if `block_size` is zero, differs from the cache's
    /// block size, or the cache is smaller than the base.
    pub fn new(base: Arc<dyn ReadonlyDevice>, cache: Arc<Cache>, block_size: u64) -> CinderResult<Self> {
        if block_size == 0 {
            return Err(CinderError::Config {
                message: "overlay block size must be non-zero".to_string(),
            });
        }
        if cache.block_size() != block_size {
            return Err(CinderError::Config {
                message: format!(
                    "overlay block size {block_size} does not match its cache's block size {}",
                    cache.block_size()
                ),
            });
        }
        if cache.size() < base.size() {
            return Err(CinderError::Config {
                message: format!(
                    "overlay cache ({} bytes) is smaller than its base ({} bytes)",
                    cache.size(),
                    base.size()
                ),
            });
        }

        Ok(Self {
            base,
            cache,
            block_size,
            write_lock: Mutex::new(()),
        })
    }

    /// The write cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    fn block_bounds(&self, block: u64) -> (u64, u64) {
        let start = block * self.block_size;
        (start, (start + self.block_size).min(self.base.size()))
    }

    /// Read a range that lies within one source (all dirty or all clean).
    async fn read_run(&self, dirty: bool, offset: u64, length: u64) -> CinderResult<Bytes> {
        if dirty {
            self.cache.read_at(offset, length).await
        } else {
            self.base.read_at(offset, length).await
        }
    }

    /// Current contents of a whole block.
    async fn read_block(&self, block: u64) -> CinderResult<Bytes> {
        let (start, end) = self.block_bounds(block);
        self.read_run(self.cache.is_dirty(block), start, end - start).await
    }
}

#[async_trait]
impl ReadonlyDevice for Overlay {
    async fn read_at(&self, offset: u64, length: u64) -> CinderResult<Bytes> {
        check_bounds(offset, length, self.size())?;
        if length == 0 {
            return Ok(Bytes::new());
        }

        let end = offset + length;
        let mut out = BytesMut::with_capacity(usize::try_from(length).unwrap_or_default());
        let mut pos = offset;

        // Coalesce consecutive blocks that come from the same source.
        while pos < end {
            let block = pos / self.block_size;
            let dirty = self.cache.is_dirty(block);

            let mut run_end = self.block_bounds(block).1.min(end);
            while run_end < end && self.cache.is_dirty(run_end / self.block_size) == dirty {
                run_end = self.block_bounds(run_end / self.block_size).1.min(end);
            }

            out.extend_from_slice(&self.read_run(dirty, pos, run_end - pos).await?);
            pos = run_end;
        }

        Ok(out.freeze())
    }

    fn size(&self) -> u64 {
        self.base.size()
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Closes both the base and the cache, reporting every failure.
    async fn close(&self) -> CinderResult<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.cache.close().await {
            errors.push(e.context("closing overlay cache"));
        }
        if let Err(e) = self.base.close().await {
            errors.push(e.context("closing overlay base"));
        }
        CinderError::join(errors)
    }
}

#[async_trait]
impl Device for Overlay {
    async fn write_at(&self, offset: u64, data: Bytes) -> CinderResult<()> {
        let length = data.len() as u64;
        check_bounds(offset, length, self.size())?;
        if length == 0 {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;

        let end = offset + length;
        let mut pos = offset;
        while pos < end {
            let block = pos / self.block_size;
            let (start, block_end) = self.block_bounds(block);

            if pos == start && end >= block_end {
                // Whole blocks: write the aligned run in one go.
                let run_blocks = (end - start) / self.block_size;
                let run_end = if end == self.size() {
                    end
                } else {
                    start + run_blocks * self.block_size
                };
                #[allow(clippy::cast_possible_truncation)]
                let chunk = data.slice((pos - offset) as usize..(run_end - offset) as usize);
                self.cache.write_at(pos, chunk).await?;
                pos = run_end;
                continue;
            }

            // Partial block: merge with its current contents.
            let current = self.read_block(block).await?;
            let mut merged = BytesMut::from(current.as_ref());
            let write_end = end.min(block_end);
            #[allow(clippy::cast_possible_truncation)]
            merged[(pos - start) as usize..(write_end - start) as usize]
                .copy_from_slice(&data[(pos - offset) as usize..(write_end - offset) as usize]);
            self.cache.write_at(start, merged.freeze()).await?;
            pos = write_end;
        }

        Ok(())
    }

    async fn flush(&self) -> CinderResult<()> {
        self.cache.flush().await
    }
}
