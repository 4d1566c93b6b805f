//! Whole-object local copies.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cinder_common::{CinderError, CinderResult, ResultExt};
use cinder_storage::ObjectStore;

/// A remote object downloaded in full to a local file.
///
/// Used for small artifacts such as the snapshot metadata, which the
/// hypervisor reads by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    path: PathBuf,
    size: u64,
}

impl LocalFile {
    /// Download `object` from `store` into `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be read or the file written.
    pub async fn fetch(store: &Arc<dyn ObjectStore>, object: &str, path: impl Into<PathBuf>) -> CinderResult<Self> {
        let path = path.into();

        let size = store
            .size(object)
            .await
            .with_context(|| format!("getting size of {object}"))?;
        let data = store.read_range(object, 0, size).await?;
        if data.len() as u64 != size {
            return Err(CinderError::Storage {
                object: object.to_string(),
                message: format!("expected {size} bytes, got {}", data.len()),
            });
        }

        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        tracing::debug!(object, path = %path.display(), size, "Downloaded object");
        Ok(Self { path, size })
    }

    /// Local path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File length in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Delete the local copy. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub async fn close(&self) -> CinderResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CinderError::from(e).context(format!("removing {}", self.path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_storage::MemoryBucket;

    #[tokio::test]
    async fn fetch_then_close() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryBucket::new().with_object("b/snapfile", &b"state"[..]));

        let file = LocalFile::fetch(&store, "b/snapfile", temp.path().join("snapfile"))
            .await
            .unwrap();
        assert_eq!(file.size(), 5);
        assert_eq!(std::fs::read(file.path()).unwrap(), b"state");

        file.close().await.unwrap();
        assert!(!file.path().exists());
        file.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_object_names_it() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryBucket::new());

        let err = LocalFile::fetch(&store, "b/snapfile", temp.path().join("snapfile"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("b/snapfile"));
    }
}
