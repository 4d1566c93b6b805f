//! Template artifacts.
//!
//! A [`Template`] is one generation of a template build's local cache. Its
//! three artifacts are resolved once, concurrently, by [`Template::fetch`];
//! every accessor waits for the corresponding resolution and then returns
//! the memoized value or error. Sandboxes hold the shared devices through
//! counted leases so an owner can wait for them before closing.

mod cache;
mod file;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cinder_block::{
    DeviceLease, HUGEPAGE_SIZE, LeaseCounter, PAGE_SIZE, ROOTFS_CHUNK_SIZE, ReadonlyDevice, RemoteDevice,
};
use cinder_common::{CinderError, CinderResult, SetOnce};
use cinder_storage::{ArtifactKind, ObjectStore, TemplateCacheFiles, TemplateFiles};

pub use cache::{TemplateCache, TemplateKey};
pub use file::LocalFile;

/// A template build's artifacts, resolved lazily and shared by every
/// sandbox booting from it.
#[derive(Debug)]
pub struct Template {
    files: TemplateCacheFiles,
    hugepages: bool,
    memfile: SetOnce<Arc<RemoteDevice>>,
    rootfs: SetOnce<Arc<RemoteDevice>>,
    snapfile: SetOnce<Arc<LocalFile>>,
    fetch_started: AtomicBool,
    leases: LeaseCounter,
}

impl Template {
    /// Create an unresolved template cached under `templates_dir`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `cache_identifier` is not a valid
    /// path segment.
    pub fn new(
        files: &TemplateFiles,
        templates_dir: &Path,
        cache_identifier: &str,
        hugepages: bool,
    ) -> CinderResult<Self> {
        Ok(Self {
            files: files.cache_files(templates_dir, cache_identifier)?,
            hugepages,
            memfile: SetOnce::new(),
            rootfs: SetOnce::new(),
            snapfile: SetOnce::new(),
            fetch_started: AtomicBool::new(false),
            leases: LeaseCounter::new(),
        })
    }

    /// Remote coordinates.
    #[must_use]
    pub const fn files(&self) -> &TemplateFiles {
        self.files.files()
    }

    /// Local cache layout.
    #[must_use]
    pub const fn cache_files(&self) -> &TemplateCacheFiles {
        &self.files
    }

    /// Whether the guest memory is backed by huge pages.
    #[must_use]
    pub const fn hugepages(&self) -> bool {
        self.hugepages
    }

    /// Chunk size of the memory snapshot.
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        if self.hugepages { HUGEPAGE_SIZE } else { PAGE_SIZE }
    }

    /// Resolve all three artifacts from `store`.
    ///
    /// The artifacts are fetched concurrently and this returns once each
    /// has resolved, successfully or not; failures are reported through the
    /// accessors. If the cache directory cannot be created every artifact
    /// fails with that error. Dropping the future fails the artifacts that
    /// have not resolved yet with [`CinderError::Cancelled`].
    ///
    /// Only the first call fetches; later calls wait for that resolution.
    pub async fn fetch(&self, store: Arc<dyn ObjectStore>) {
        if self.fetch_started.swap(true, Ordering::AcqRel) {
            tracing::debug!(template = %self.files(), "Template fetch already started, waiting");
            self.wait_resolved().await;
            return;
        }

        let guard = CancelGuard {
            template: self,
            armed: true,
        };

        let cache_dir = self.files.cache_dir();
        tracing::info!(
            template_id = %self.files().template_id,
            build_id = %self.files().build_id,
            cache_dir = %cache_dir.display(),
            "Fetching template"
        );

        if let Err(e) = tokio::fs::create_dir_all(&cache_dir).await {
            let err = Arc::new(CinderError::from(e).context(format!(
                "creating template cache directory {}",
                cache_dir.display()
            )));
            self.fail_unresolved(|| CinderError::Shared(Arc::clone(&err)));
            guard.disarm();
            return;
        }

        tokio::join!(
            self.fetch_memfile(&store),
            self.fetch_rootfs(&store),
            self.fetch_snapfile(&store),
        );

        guard.disarm();
    }

    async fn fetch_memfile(&self, store: &Arc<dyn ObjectStore>) {
        let result = RemoteDevice::open(
            Arc::clone(store),
            self.files().storage_memfile_path(),
            self.page_size(),
            self.files.cache_memfile_path(),
        )
        .await
        .map(Arc::new);
        resolve(&self.memfile, ArtifactKind::Memfile, result);
    }

    async fn fetch_rootfs(&self, store: &Arc<dyn ObjectStore>) {
        let result = RemoteDevice::open(
            Arc::clone(store),
            self.files().storage_rootfs_path(),
            ROOTFS_CHUNK_SIZE,
            self.files.cache_rootfs_path(),
        )
        .await
        .map(Arc::new);
        resolve(&self.rootfs, ArtifactKind::Rootfs, result);
    }

    async fn fetch_snapfile(&self, store: &Arc<dyn ObjectStore>) {
        let result = LocalFile::fetch(
            store,
            &self.files().storage_snapfile_path(),
            self.files.cache_snapfile_path(),
        )
        .await
        .map(Arc::new);
        resolve(&self.snapfile, ArtifactKind::Snapfile, result);
    }

    fn fail_unresolved(&self, err: impl Fn() -> CinderError) {
        // Losing the race to a resolution is fine.
        let _ = self.memfile.set_error(err());
        let _ = self.rootfs.set_error(err());
        let _ = self.snapfile.set_error(err());
    }

    /// The memory snapshot device. Waits for resolution.
    ///
    /// # Errors
    ///
    /// Returns the memoized resolution error.
    pub async fn memfile(&self) -> CinderResult<Arc<RemoteDevice>> {
        self.memfile.wait().await
    }

    /// The root filesystem device. Waits for resolution.
    ///
    /// # Errors
    ///
    /// Returns the memoized resolution error.
    pub async fn rootfs(&self) -> CinderResult<Arc<RemoteDevice>> {
        self.rootfs.wait().await
    }

    /// The snapshot metadata file. Waits for resolution.
    ///
    /// # Errors
    ///
    /// Returns the memoized resolution error.
    pub async fn snapfile(&self) -> CinderResult<Arc<LocalFile>> {
        self.snapfile.wait().await
    }

    /// Whether every artifact has resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.memfile.is_resolved() && self.rootfs.is_resolved() && self.snapfile.is_resolved()
    }

    /// Whether any artifact failed to resolve.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        matches!(self.memfile.get(), Some(Err(_)))
            || matches!(self.rootfs.get(), Some(Err(_)))
            || matches!(self.snapfile.get(), Some(Err(_)))
    }

    /// Wait until every artifact has resolved, ignoring the outcomes.
    pub async fn wait_resolved(&self) {
        let _ = tokio::join!(self.memfile(), self.rootfs(), self.snapfile());
    }

    /// Wait for every artifact and fail if any of them did not resolve.
    ///
    /// # Errors
    ///
    /// Returns the first artifact's memoized error.
    pub async fn ready(&self) -> CinderResult<()> {
        let (memfile, rootfs, snapfile) = tokio::join!(self.memfile(), self.rootfs(), self.snapfile());
        memfile?;
        rootfs?;
        snapfile?;
        Ok(())
    }

    /// A counted lease on the root filesystem device. Waits for resolution.
    ///
    /// # Errors
    ///
    /// Returns the memoized resolution error.
    pub async fn lease_rootfs(&self) -> CinderResult<DeviceLease> {
        let rootfs: Arc<dyn ReadonlyDevice> = self.rootfs().await?;
        Ok(self.leases.lease(rootfs))
    }

    /// Number of device leases still held.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.leases.active()
    }

    /// Wait until every device lease has ended.
    pub async fn wait_unleased(&self) {
        self.leases.wait_idle().await;
    }

    /// Close every resolved artifact, deleting its cache file.
    ///
    /// Callers wait for [`Template::fetch`] to finish and for outstanding
    /// leases to end first; artifacts still unresolved are skipped.
    ///
    /// # Errors
    ///
    /// Returns every failure, joined.
    pub async fn close(&self) -> CinderResult<()> {
        let mut errors = Vec::new();

        if let Some(Ok(memfile)) = self.memfile.get() {
            if let Err(e) = memfile.close().await {
                errors.push(e.context("closing memfile"));
            }
        }
        if let Some(Ok(rootfs)) = self.rootfs.get() {
            if let Err(e) = rootfs.close().await {
                errors.push(e.context("closing rootfs"));
            }
        }
        if let Some(Ok(snapfile)) = self.snapfile.get() {
            if let Err(e) = snapfile.close().await {
                errors.push(e.context("closing snapfile"));
            }
        }

        match tokio::fs::remove_dir(self.files.cache_dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::debug!(error = %e, "Template cache directory left in place"),
        }

        tracing::debug!(
            template_id = %self.files().template_id,
            build_id = %self.files().build_id,
            "Template closed"
        );
        CinderError::join(errors)
    }
}

fn resolve<T: Clone>(cell: &SetOnce<T>, kind: ArtifactKind, result: CinderResult<T>) {
    let outcome = match result {
        Ok(value) => {
            tracing::debug!(artifact = %kind, "Template artifact resolved");
            cell.set_value(value)
        }
        Err(e) => {
            tracing::warn!(artifact = %kind, error = %e, "Template artifact failed");
            cell.set_error(e.context(format!("fetching {kind}")))
        }
    };

    if outcome.is_err() {
        tracing::warn!(artifact = %kind, "Template artifact was already resolved");
    }
}

/// Fails unresolved artifacts when a fetch is dropped midway.
struct CancelGuard<'a> {
    template: &'a Template,
    armed: bool,
}

impl CancelGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(template = %self.template.files(), "Template fetch cancelled");
        self.template.fail_unresolved(|| CinderError::Cancelled {
            operation: format!("fetching template {}", self.template.files()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_storage::MemoryBucket;
    use std::time::Duration;

    fn files() -> TemplateFiles {
        TemplateFiles::new("base", "b-1", "vmlinux-6.1", "v1.10").unwrap()
    }

    fn bucket() -> MemoryBucket {
        MemoryBucket::new()
            .with_object("b-1/memfile", vec![1u8; 3 * 4096])
            .with_object("b-1/rootfs.ext4", vec![2u8; 8192])
            .with_object("b-1/snapfile", &b"snap"[..])
    }

    #[test]
    fn page_size_follows_hugepages() {
        let temp = tempfile::tempdir().unwrap();
        let small = Template::new(&files(), temp.path(), "gen", false).unwrap();
        let huge = Template::new(&files(), temp.path(), "gen", true).unwrap();
        assert_eq!(small.page_size(), 4096);
        assert_eq!(huge.page_size(), 2 << 20);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_waiters_share_one_fetch() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(bucket().with_latency(Duration::from_millis(5)));
        let template = Arc::new(Template::new(&files(), temp.path(), "gen", false).unwrap());

        let waiters: Vec<_> = (0..16)
            .map(|_| {
                let template = Arc::clone(&template);
                tokio::spawn(async move {
                    let memfile = template.memfile().await.unwrap();
                    let rootfs = template.rootfs().await.unwrap();
                    let snapfile = template.snapfile().await.unwrap();
                    (memfile.size(), rootfs.size(), snapfile.size())
                })
            })
            .collect();

        template.fetch(bucket.clone()).await;

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), (3 * 4096, 8192, 4));
        }
        // One length lookup per artifact.
        assert_eq!(bucket.size_lookups(), 3);

        // Memoized: later calls do not fetch again.
        template.rootfs().await.unwrap();
        assert_eq!(bucket.size_lookups(), 3);

        template.close().await.unwrap();
    }

    #[tokio::test]
    async fn second_fetch_keeps_resolved_devices() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(bucket());
        let template = Template::new(&files(), temp.path(), "gen", false).unwrap();

        template.fetch(bucket.clone()).await;
        let rootfs = template.rootfs().await.unwrap();
        assert_eq!(rootfs.read_at(0, 4).await.unwrap().as_ref(), &[2u8; 4]);
        assert_eq!(bucket.size_lookups(), 3);

        template.fetch(bucket.clone()).await;

        // The cache files were not recreated under the resolved devices.
        assert_eq!(rootfs.read_at(0, 4).await.unwrap().as_ref(), &[2u8; 4]);
        assert_eq!(template.snapfile().await.unwrap().size(), 4);
        assert_eq!(bucket.size_lookups(), 3);

        template.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_fetches_resolve_once() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(bucket().with_latency(Duration::from_millis(5)));
        let template = Template::new(&files(), temp.path(), "gen", false).unwrap();

        tokio::join!(template.fetch(bucket.clone()), template.fetch(bucket.clone()));

        assert!(template.is_resolved());
        assert_eq!(bucket.size_lookups(), 3);
        template.close().await.unwrap();
    }

    #[tokio::test]
    async fn ready_reports_any_failed_artifact() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(
            MemoryBucket::new()
                .with_object("b-1/rootfs.ext4", vec![2u8; 4096])
                .with_object("b-1/snapfile", &b"snap"[..]),
        );
        let template = Template::new(&files(), temp.path(), "gen", false).unwrap();
        template.fetch(bucket).await;

        template.rootfs().await.unwrap();
        let err = template.ready().await.unwrap_err();
        assert!(err.to_string().contains("b-1/memfile"));

        template.close().await.unwrap();
    }

    #[tokio::test]
    async fn rootfs_leases_are_counted() {
        let temp = tempfile::tempdir().unwrap();
        let template = Template::new(&files(), temp.path(), "gen", false).unwrap();
        template.fetch(Arc::new(bucket())).await;

        let lease = template.lease_rootfs().await.unwrap();
        assert_eq!(template.active_leases(), 1);
        assert_eq!(lease.read_at(0, 2).await.unwrap().as_ref(), &[2u8; 2]);

        lease.close().await.unwrap();
        assert_eq!(template.active_leases(), 0);
        template.wait_unleased().await;

        template.close().await.unwrap();
    }

    #[tokio::test]
    async fn resolution_errors_are_memoized() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(
            MemoryBucket::new()
                .with_object("b-1/memfile", vec![1u8; 4096])
                .with_object("b-1/snapfile", &b"snap"[..]),
        );
        let template = Template::new(&files(), temp.path(), "gen", false).unwrap();

        template.fetch(bucket.clone()).await;

        let first = template.rootfs().await.unwrap_err().to_string();
        let second = template.rootfs().await.unwrap_err().to_string();
        assert_eq!(first, second);
        assert!(first.contains("b-1/rootfs.ext4"));
        assert!(template.has_failed());

        // The other artifacts are unaffected.
        template.memfile().await.unwrap();
        template.snapfile().await.unwrap();
        assert_eq!(bucket.size_lookups(), 3);

        template.close().await.unwrap();
    }

    #[tokio::test]
    async fn unusable_cache_dir_fails_every_artifact() {
        let temp = tempfile::tempdir().unwrap();
        // A file where the templates directory should be.
        let blocker = temp.path().join("template");
        std::fs::write(&blocker, b"").unwrap();

        let bucket = Arc::new(bucket());
        let template = Template::new(&files(), &blocker, "gen", false).unwrap();
        template.fetch(bucket.clone()).await;

        assert!(template.memfile().await.is_err());
        assert!(template.rootfs().await.is_err());
        let err = template.snapfile().await.unwrap_err();
        assert!(err.to_string().contains("creating template cache directory"));

        // Nothing was attempted remotely.
        assert_eq!(bucket.size_lookups(), 0);
    }

    #[tokio::test]
    async fn same_generation_instances_do_not_share_files() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(bucket());

        let a = Template::new(&files(), temp.path(), "gen", false).unwrap();
        let b = Template::new(&files(), temp.path(), "gen", false).unwrap();
        assert_ne!(a.cache_files().cache_dir(), b.cache_files().cache_dir());

        a.fetch(bucket.clone()).await;
        b.fetch(bucket.clone()).await;

        let a_rootfs = a.rootfs().await.unwrap();
        let b_rootfs = b.rootfs().await.unwrap();
        assert_ne!(a_rootfs.cache_path(), b_rootfs.cache_path());

        a_rootfs.read_at(0, 8192).await.unwrap();
        a.close().await.unwrap();

        // Closing one instance leaves the other's cache intact.
        assert!(b_rootfs.cache_path().exists());
        assert_eq!(b_rootfs.read_at(0, 4).await.unwrap().as_ref(), &[2u8; 4]);
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_fetch_cancels_unresolved_artifacts() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(bucket().with_latency(Duration::from_secs(60)));
        let template = Template::new(&files(), temp.path(), "gen", false).unwrap();

        let devices_ready = async {
            template.memfile().await.unwrap();
            template.rootfs().await.unwrap();
        };
        tokio::select! {
            () = template.fetch(bucket) => panic!("fetch should still be downloading the snapfile"),
            () = devices_ready => {}
        }

        // The devices only need a length lookup and resolve right away; the
        // snapfile download was cut short.
        assert!(template.memfile().await.is_ok());
        assert!(template.rootfs().await.is_ok());
        let err = template.snapfile().await.unwrap_err();
        assert!(err.is_cancelled());

        template.close().await.unwrap();
    }
}
