//! A local directory acting as a bucket.
//!
//! Useful for development and for running the engine against artifacts
//! already on disk.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use cinder_common::{CinderError, CinderResult, blocking};

use crate::store::ObjectStore;

/// Objects stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
    name: String,
}

impl LocalBucket {
    /// Use `root` as the bucket directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = root.display().to_string();
        Self { root, name }
    }

    /// The bucket directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, path: &str) -> CinderResult<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(CinderError::Storage {
                object: path.to_string(),
                message: "object path must be relative and stay inside the bucket".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

fn not_found(path: &str, err: io::Error) -> CinderError {
    if err.kind() == io::ErrorKind::NotFound {
        CinderError::ObjectNotFound {
            object: path.to_string(),
        }
    } else {
        CinderError::Storage {
            object: path.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn size(&self, path: &str) -> CinderResult<u64> {
        let file = self.object_path(path)?;
        let metadata = tokio::fs::metadata(&file)
            .await
            .map_err(|e| not_found(path, e))?;
        Ok(metadata.len())
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> CinderResult<Bytes> {
        let file = self.object_path(path)?;
        let object = path.to_string();

        blocking(move || {
            let mut f = std::fs::File::open(&file).map_err(|e| not_found(&object, e))?;
            f.seek(SeekFrom::Start(offset))?;

            let mut buf = Vec::new();
            f.take(length).read_to_end(&mut buf)?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn write(&self, path: &str, data: Bytes) -> CinderResult<()> {
        let file = self.object_path(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, &data).await?;
        Ok(())
    }

    async fn upload(&self, path: &str, source: &Path) -> CinderResult<()> {
        let file = self.object_path(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, &file).await?;
        tracing::debug!(object = path, source = %source.display(), "Copied into local bucket");
        Ok(())
    }

    async fn delete(&self, path: &str) -> CinderResult<()> {
        let file = self.object_path(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_then_read_ranges() {
        let temp = tempdir().unwrap();
        let bucket = LocalBucket::new(temp.path());

        bucket
            .write("build/memfile", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        assert_eq!(bucket.size("build/memfile").await.unwrap(), 10);
        assert_eq!(
            bucket.read_range("build/memfile", 2, 3).await.unwrap(),
            Bytes::from_static(b"234")
        );
        // Short read at the end of the object.
        assert_eq!(
            bucket.read_range("build/memfile", 8, 10).await.unwrap(),
            Bytes::from_static(b"89")
        );
    }

    #[tokio::test]
    async fn missing_object() {
        let temp = tempdir().unwrap();
        let bucket = LocalBucket::new(temp.path());

        let err = bucket.size("nope").await.unwrap_err();
        assert!(matches!(err, CinderError::ObjectNotFound { .. }));
        let err = bucket.read_range("nope", 0, 1).await.unwrap_err();
        assert!(matches!(err, CinderError::ObjectNotFound { .. }));

        bucket.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let temp = tempdir().unwrap();
        let bucket = LocalBucket::new(temp.path());

        assert!(bucket.size("../etc/passwd").await.is_err());
        assert!(bucket.size("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn upload_copies_file() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("rootfs.ext4");
        std::fs::write(&source, b"ext4").unwrap();

        let bucket = LocalBucket::new(temp.path().join("bucket"));
        bucket.upload("b/rootfs.ext4", &source).await.unwrap();

        assert_eq!(
            std::fs::read(bucket.root().join("b/rootfs.ext4")).unwrap(),
            b"ext4"
        );
    }
}
