//! Publishing template build artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cinder_common::{CinderError, CinderResult};
use futures::future::join_all;

use crate::store::ObjectStore;
use crate::template::{ArtifactKind, TemplateFiles};

/// Local files to publish for a build. Any artifact may be omitted.
#[derive(Debug, Clone, Default)]
pub struct UploadSources {
    /// Snapshot metadata file.
    pub snapfile: Option<PathBuf>,
    /// Memory snapshot file.
    pub memfile: Option<PathBuf>,
    /// Root filesystem image.
    pub rootfs: Option<PathBuf>,
}

impl UploadSources {
    fn artifacts(&self) -> impl Iterator<Item = (ArtifactKind, &Path)> {
        [
            (ArtifactKind::Snapfile, self.snapfile.as_deref()),
            (ArtifactKind::Memfile, self.memfile.as_deref()),
            (ArtifactKind::Rootfs, self.rootfs.as_deref()),
        ]
        .into_iter()
        .filter_map(|(kind, path)| path.map(|p| (kind, p)))
    }
}

/// Uploads and removes the artifacts of one template build.
#[derive(Debug, Clone)]
pub struct TemplateUpload {
    store: Arc<dyn ObjectStore>,
    files: TemplateFiles,
}

impl TemplateUpload {
    /// Create an uploader for `files` in `store`.
    pub fn new(store: Arc<dyn ObjectStore>, files: TemplateFiles) -> Self {
        Self { store, files }
    }

    /// Upload every given artifact concurrently.
    ///
    /// # Errors
    ///
    /// Returns every failed upload, joined.
    pub async fn upload(&self, sources: &UploadSources) -> CinderResult<()> {
        let uploads = sources.artifacts().map(|(kind, source)| async move {
            let object = self.files.storage_path(kind);
            tracing::info!(
                bucket = %self.store.name(),
                object = %object,
                source = %source.display(),
                "Uploading {kind}"
            );
            self.store
                .upload(&object, source)
                .await
                .map_err(|e| e.context(format!("error when uploading {kind}")))
        });

        let errors: Vec<CinderError> = join_all(uploads)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        CinderError::join(errors)
    }

    /// Delete the build's artifacts.
    ///
    /// # Errors
    ///
    /// Returns every failed deletion, joined.
    pub async fn remove(&self) -> CinderResult<()> {
        let deletions = ArtifactKind::ALL.into_iter().map(|kind| async move {
            let object = self.files.storage_path(kind);
            self.store.delete(&object).await.map_err(|e| {
                e.context(format!(
                    "error when removing template build '{}'",
                    self.files.storage_dir()
                ))
            })
        });

        let errors: Vec<CinderError> = join_all(deletions)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        CinderError::join(errors)
    }
}
