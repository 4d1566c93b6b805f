//! Process-wide registry of templates.

use std::path::PathBuf;
use std::sync::Arc;

use cinder_common::{CinderError, CinderResult, id};
use cinder_storage::{ObjectStore, TemplateFiles};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::Template;

/// Identifies one template generation in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    /// Remote coordinates.
    pub files: TemplateFiles,
    /// Huge-page memory layout.
    pub hugepages: bool,
}

impl TemplateKey {
    /// Key for `files`.
    #[must_use]
    pub const fn new(files: TemplateFiles, hugepages: bool) -> Self {
        Self { files, hugepages }
    }
}

/// Shares one [`Template`] per generation between all sandboxes.
///
/// The first reference to a template starts its fetch in the background;
/// later references get the same instance.
#[derive(Debug)]
pub struct TemplateCache {
    store: Arc<dyn ObjectStore>,
    templates_dir: PathBuf,
    cache_identifier: String,
    templates: DashMap<TemplateKey, Arc<Template>>,
}

impl TemplateCache {
    /// A registry fetching from `store` into `templates_dir` under a fresh
    /// cache generation.
    pub fn new(store: Arc<dyn ObjectStore>, templates_dir: impl Into<PathBuf>) -> Self {
        Self::with_cache_identifier(store, templates_dir, id::cache_identifier())
    }

    /// A registry with an explicit cache generation.
    pub fn with_cache_identifier(
        store: Arc<dyn ObjectStore>,
        templates_dir: impl Into<PathBuf>,
        cache_identifier: impl Into<String>,
    ) -> Self {
        Self {
            store,
            templates_dir: templates_dir.into(),
            cache_identifier: cache_identifier.into(),
            templates: DashMap::new(),
        }
    }

    /// Cache generation of every template in this registry.
    #[must_use]
    pub fn cache_identifier(&self) -> &str {
        &self.cache_identifier
    }

    /// Number of registered templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether no template is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// The template for `key`, registering it and starting its fetch on
    /// first use. A template whose fetch failed is replaced; the replaced
    /// one is closed once its devices are no longer leased.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the template cannot be created.
    pub fn get_or_fetch(&self, key: TemplateKey) -> CinderResult<Arc<Template>> {
        let (template, replaced) = match self.templates.entry(key.clone()) {
            Entry::Occupied(entry) if !entry.get().has_failed() => {
                return Ok(Arc::clone(entry.get()));
            }
            Entry::Occupied(mut entry) => {
                let template = self.start(&key)?;
                let stale = entry.insert(Arc::clone(&template));
                tracing::info!(template = %key.files, "Replacing failed template");
                (template, Some(stale))
            }
            Entry::Vacant(entry) => {
                let template = self.start(&key)?;
                entry.insert(Arc::clone(&template));
                (template, None)
            }
        };

        if let Some(stale) = replaced {
            tokio::spawn(async move {
                stale.wait_resolved().await;
                stale.wait_unleased().await;
                if let Err(e) = stale.close().await {
                    tracing::warn!(template = %stale.files(), error = %e, "Failed to close replaced template");
                }
            });
        }
        Ok(template)
    }

    fn start(&self, key: &TemplateKey) -> CinderResult<Arc<Template>> {
        let template = Arc::new(Template::new(
            &key.files,
            &self.templates_dir,
            &self.cache_identifier,
            key.hugepages,
        )?);

        let fetching = Arc::clone(&template);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move { fetching.fetch(store).await });

        Ok(template)
    }

    /// The registered template for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &TemplateKey) -> Option<Arc<Template>> {
        self.templates.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a template, wait for its fetch to settle and its leases to
    /// end, then close it.
    ///
    /// Returns whether the template was registered.
    ///
    /// # Errors
    ///
    /// Returns the errors from closing the template.
    pub async fn evict(&self, key: &TemplateKey) -> CinderResult<bool> {
        let Some((_, template)) = self.templates.remove(key) else {
            return Ok(false);
        };

        tracing::debug!(
            template = %key.files,
            leases = template.active_leases(),
            "Evicting template"
        );
        template.wait_resolved().await;
        template.wait_unleased().await;
        template.close().await?;
        Ok(true)
    }

    /// Evict every template.
    ///
    /// # Errors
    ///
    /// Returns every failure, joined.
    pub async fn close_all(&self) -> CinderResult<()> {
        let keys: Vec<TemplateKey> = self.templates.iter().map(|entry| entry.key().clone()).collect();

        let mut errors = Vec::new();
        for key in keys {
            if let Err(e) = self.evict(&key).await {
                errors.push(e.context(format!("closing template {}", key.files)));
            }
        }
        CinderError::join(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_block::ReadonlyDevice;
    use cinder_storage::MemoryBucket;
    use std::time::Duration;

    fn key(build: &str) -> TemplateKey {
        TemplateKey::new(
            TemplateFiles::new("base", build, "vmlinux-6.1", "v1.10").unwrap(),
            false,
        )
    }

    fn bucket() -> Arc<MemoryBucket> {
        Arc::new(
            MemoryBucket::new()
                .with_object("b-1/memfile", vec![1u8; 4096])
                .with_object("b-1/rootfs.ext4", vec![2u8; 4096])
                .with_object("b-1/snapfile", &b"snap"[..]),
        )
    }

    #[tokio::test]
    async fn one_template_per_generation() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = bucket();
        let cache = TemplateCache::with_cache_identifier(bucket.clone(), temp.path(), "gen-1");

        let a = cache.get_or_fetch(key("b-1")).unwrap();
        let b = cache.get_or_fetch(key("b-1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        a.rootfs().await.unwrap();
        b.memfile().await.unwrap();
        b.snapfile().await.unwrap();
        assert_eq!(bucket.size_lookups(), 3);
        assert_eq!(a.cache_files().cache_identifier(), "gen-1");

        cache.close_all().await.unwrap();
        assert!(cache.is_empty());
        assert!(!a.cache_files().cache_dir().exists());
    }

    #[tokio::test]
    async fn failed_template_is_replaced() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(MemoryBucket::new());
        let cache = TemplateCache::new(bucket.clone(), temp.path());

        let first = cache.get_or_fetch(key("b-1")).unwrap();
        assert!(first.rootfs().await.is_err());
        first.wait_resolved().await;

        bucket.insert("b-1/memfile", vec![1u8; 4096]);
        bucket.insert("b-1/rootfs.ext4", vec![2u8; 4096]);
        bucket.insert("b-1/snapfile", &b"snap"[..]);

        let second = cache.get_or_fetch(key("b-1")).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        second.rootfs().await.unwrap();

        cache.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn replaced_template_stays_open_while_leased() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(
            MemoryBucket::new()
                .with_object("b-1/rootfs.ext4", vec![2u8; 4096])
                .with_object("b-1/snapfile", &b"snap"[..]),
        );
        let cache = TemplateCache::new(bucket.clone(), temp.path());

        let first = cache.get_or_fetch(key("b-1")).unwrap();
        let lease = first.lease_rootfs().await.unwrap();
        first.wait_resolved().await;
        assert!(first.has_failed());

        bucket.insert("b-1/memfile", vec![1u8; 4096]);
        let second = cache.get_or_fetch(key("b-1")).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        second.ready().await.unwrap();

        // The held rootfs of the replaced template keeps working.
        tokio::task::yield_now().await;
        assert_eq!(lease.read_at(0, 2).await.unwrap().as_ref(), &[2u8; 2]);

        let rootfs = first.rootfs().await.unwrap();
        lease.close().await.unwrap();

        // Once unleased, the replaced template is closed in the background.
        tokio::time::timeout(Duration::from_secs(5), async {
            while rootfs.read_at(0, 2).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cache.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn evict_waits_for_leases() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Arc::new(TemplateCache::new(bucket(), temp.path()));
        let template = cache.get_or_fetch(key("b-1")).unwrap();
        let lease = template.lease_rootfs().await.unwrap();

        let evicting = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.evict(&key("b-1")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!evicting.is_finished());
        assert_eq!(lease.read_at(0, 2).await.unwrap().as_ref(), &[2u8; 2]);

        drop(lease);
        assert!(evicting.await.unwrap().unwrap());
        assert!(!template.cache_files().cache_dir().exists());
    }

    #[tokio::test]
    async fn evict_unknown_template() {
        let temp = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(bucket(), temp.path());
        assert!(!cache.evict(&key("b-9")).await.unwrap());
    }
}
