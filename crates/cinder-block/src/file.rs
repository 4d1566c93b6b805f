//! Positional I/O on local backing files.
//!
//! Disk I/O runs on tokio's blocking pool so device reads never stall the
//! async workers.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use cinder_common::{CinderError, CinderResult, blocking};

/// A sparse file addressed by byte offset.
#[derive(Debug, Clone)]
pub(crate) struct BlockFile {
    file: Arc<File>,
    path: PathBuf,
}

impl BlockFile {
    /// Create (or truncate) `path` as a sparse file of `size` bytes.
    pub(crate) async fn create(path: &Path, size: u64) -> CinderResult<Self> {
        let path = path.to_path_buf();
        blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.set_len(size)?;

            Ok(Self {
                file: Arc::new(file),
                path,
            })
        })
        .await
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn read_at(&self, offset: u64, length: u64) -> CinderResult<Bytes> {
        let file = Arc::clone(&self.file);
        blocking(move || {
            let len = usize::try_from(length).map_err(|_| CinderError::OutOfBounds {
                offset,
                length,
                size: usize::MAX as u64,
            })?;
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    pub(crate) async fn write_at(&self, offset: u64, data: Bytes) -> CinderResult<()> {
        let file = Arc::clone(&self.file);
        blocking(move || {
            file.write_all_at(&data, offset)?;
            Ok(())
        })
        .await
    }

    pub(crate) async fn sync(&self) -> CinderResult<()> {
        let file = Arc::clone(&self.file);
        blocking(move || {
            file.sync_data()?;
            Ok(())
        })
        .await
    }

    /// Unlink the file. Open handles stay valid until dropped.
    pub(crate) async fn remove(&self) -> CinderResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
