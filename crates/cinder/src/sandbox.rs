//! Sandbox root filesystems.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cinder_block::{ROOTFS_BLOCK_SIZE, ReadonlyDevice};
use cinder_common::{CinderConfig, CinderError, CinderResult, ResultExt, SandboxId};
use cinder_nbd::{NbdDriver, SlotPool};

use crate::cow::CowDevice;
use crate::template::Template;

/// The started root filesystem of one sandbox.
///
/// The template's shared rootfs is leased, layered under a private overlay
/// stored in the sandbox directory and exported over NBD.
#[derive(Debug)]
pub struct SandboxRootfs {
    id: SandboxId,
    dir: PathBuf,
    cow: CowDevice,
}

impl SandboxRootfs {
    /// Build and start the root filesystem of sandbox `id` from `template`.
    ///
    /// # Errors
    ///
    /// Fails if any template artifact did not resolve or the device cannot
    /// be exported. Nothing is left behind on failure.
    pub async fn start(
        id: SandboxId,
        template: &Template,
        config: &CinderConfig,
        pool: Arc<dyn SlotPool>,
        driver: Arc<dyn NbdDriver>,
    ) -> CinderResult<Self> {
        // A sandbox never boots from a partially resolved template.
        template
            .ready()
            .await
            .with_context(|| format!("template {} is unavailable", template.files()))?;
        let base: Arc<dyn ReadonlyDevice> = Arc::new(template.lease_rootfs().await?);

        let dir = config.paths.sandbox(id.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating sandbox directory {}", dir.display()))?;

        let cow = match CowDevice::new(
            base,
            config.paths.sandbox_rootfs_overlay(id.as_str()),
            ROOTFS_BLOCK_SIZE,
            pool,
            driver,
            &config.nbd,
        )
        .await
        {
            Ok(cow) => cow.with_release_policy(config.release.clone()),
            Err(e) => {
                remove_dir(&dir).await;
                return Err(e.context(format!("preparing rootfs of sandbox {id}")));
            }
        };

        if let Err(e) = cow.start().await {
            let err = e.context(format!("starting rootfs of sandbox {id}"));
            let err = match cow.close().await {
                Ok(()) => err,
                Err(cleanup) => CinderError::Multiple(vec![err, cleanup]),
            };
            remove_dir(&dir).await;
            return Err(err);
        }

        tracing::info!(sandbox = %id, template = %template.files(), "Sandbox rootfs started");
        Ok(Self { id, dir, cow })
    }

    /// Sandbox ID.
    #[must_use]
    pub const fn id(&self) -> &SandboxId {
        &self.id
    }

    /// Sandbox directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The copy-on-write device.
    #[must_use]
    pub const fn device(&self) -> &CowDevice {
        &self.cow
    }

    /// The device path to hand to the hypervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is not exported.
    pub async fn path(&self) -> CinderResult<PathBuf> {
        self.cow.path().await
    }

    /// Tear the root filesystem down and delete the sandbox directory.
    ///
    /// # Errors
    ///
    /// Returns every failure, joined.
    pub async fn close(&self) -> CinderResult<()> {
        let result = self.cow.close().await;
        remove_dir(&self.dir).await;
        tracing::info!(sandbox = %self.id, "Sandbox rootfs closed");
        result
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove sandbox directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cinder_block::Device;
    use cinder_nbd::{DevicePool, NbdConnection, SlotProbe};
    use cinder_storage::{MemoryBucket, TemplateFiles};

    #[derive(Debug)]
    struct IdleProbe;

    impl SlotProbe for IdleProbe {
        fn in_use(&self, _slot: u32) -> CinderResult<bool> {
            Ok(false)
        }
    }

    #[derive(Debug)]
    struct LoopbackDriver;

    #[derive(Debug)]
    struct LoopbackConnection(u32);

    #[async_trait]
    impl NbdConnection for LoopbackConnection {
        fn slot(&self) -> u32 {
            self.0
        }

        async fn disconnect(&mut self) -> CinderResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl NbdDriver for LoopbackDriver {
        async fn connect(&self, slot: u32, _device: Arc<dyn Device>) -> CinderResult<Box<dyn NbdConnection>> {
            Ok(Box::new(LoopbackConnection(slot)))
        }
    }

    fn files() -> TemplateFiles {
        TemplateFiles::new("base", "b-1", "vmlinux-6.1", "v1.10").unwrap()
    }

    #[tokio::test]
    async fn starts_on_resolved_template_and_shares_its_rootfs() {
        let temp = tempfile::tempdir().unwrap();
        let config = CinderConfig::default().with_root(temp.path());
        let bucket = Arc::new(
            MemoryBucket::new()
                .with_object("b-1/memfile", vec![1u8; 4096])
                .with_object("b-1/rootfs.ext4", vec![2u8; 16384])
                .with_object("b-1/snapfile", &b"snap"[..]),
        );
        let template = Template::new(&files(), &config.paths.templates(), "gen", false).unwrap();
        template.fetch(bucket).await;

        let pool = Arc::new(DevicePool::new(4, Arc::new(IdleProbe)));
        let driver: Arc<dyn NbdDriver> = Arc::new(LoopbackDriver);

        let a = SandboxRootfs::start(SandboxId::new("sbx-a").unwrap(), &template, &config, pool.clone(), driver.clone())
            .await
            .unwrap();
        let b = SandboxRootfs::start(SandboxId::new("sbx-b").unwrap(), &template, &config, pool.clone(), driver)
            .await
            .unwrap();
        assert_ne!(a.path().await.unwrap(), b.path().await.unwrap());
        assert!(config.paths.sandbox_rootfs_overlay("sbx-a").exists());

        a.device().overlay().write_at(0, vec![7u8; 4096].into()).await.unwrap();
        assert_eq!(a.device().overlay().read_at(0, 2).await.unwrap().as_ref(), &[7u8; 2]);
        assert_eq!(b.device().overlay().read_at(0, 2).await.unwrap().as_ref(), &[2u8; 2]);

        a.close().await.unwrap();
        assert!(!a.dir().exists());

        // The shared rootfs outlives the sandbox that closed.
        assert_eq!(b.device().overlay().read_at(4096, 2).await.unwrap().as_ref(), &[2u8; 2]);
        assert_eq!(template.active_leases(), 1);
        b.close().await.unwrap();
        assert_eq!(pool.allocated(), 0);
        assert_eq!(template.active_leases(), 0);

        template.close().await.unwrap();
    }

    #[tokio::test]
    async fn unresolved_template_fails_startup() {
        let temp = tempfile::tempdir().unwrap();
        let config = CinderConfig::default().with_root(temp.path());
        let template = Template::new(&files(), &config.paths.templates(), "gen", false).unwrap();
        template.fetch(Arc::new(MemoryBucket::new())).await;

        let pool = Arc::new(DevicePool::new(4, Arc::new(IdleProbe)));
        let err = SandboxRootfs::start(
            SandboxId::new("sbx-a").unwrap(),
            &template,
            &config,
            pool.clone(),
            Arc::new(LoopbackDriver),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("is unavailable"));
        assert!(!config.paths.sandbox("sbx-a").exists());
        assert_eq!(pool.allocated(), 0);
    }

    #[tokio::test]
    async fn partially_resolved_template_fails_startup() {
        let temp = tempfile::tempdir().unwrap();
        let config = CinderConfig::default().with_root(temp.path());
        let bucket = Arc::new(
            MemoryBucket::new()
                .with_object("b-1/rootfs.ext4", vec![2u8; 4096])
                .with_object("b-1/snapfile", &b"snap"[..]),
        );
        let template = Template::new(&files(), &config.paths.templates(), "gen", false).unwrap();
        template.fetch(bucket).await;
        template.rootfs().await.unwrap();

        let pool = Arc::new(DevicePool::new(4, Arc::new(IdleProbe)));
        let err = SandboxRootfs::start(
            SandboxId::new("sbx-a").unwrap(),
            &template,
            &config,
            pool.clone(),
            Arc::new(LoopbackDriver),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("b-1/memfile"));
        assert!(!config.paths.sandbox("sbx-a").exists());
        assert_eq!(template.active_leases(), 0);
        assert_eq!(pool.allocated(), 0);
        template.close().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_pool_fails_startup_cleanly() {
        let temp = tempfile::tempdir().unwrap();
        let config = CinderConfig::default().with_root(temp.path());
        let bucket = Arc::new(
            MemoryBucket::new()
                .with_object("b-1/memfile", vec![1u8; 4096])
                .with_object("b-1/rootfs.ext4", vec![2u8; 4096])
                .with_object("b-1/snapfile", &b"snap"[..]),
        );
        let template = Template::new(&files(), &config.paths.templates(), "gen", false).unwrap();
        template.fetch(bucket).await;

        let pool = Arc::new(DevicePool::new(0, Arc::new(IdleProbe)));
        let err = SandboxRootfs::start(
            SandboxId::new("sbx-a").unwrap(),
            &template,
            &config,
            pool,
            Arc::new(LoopbackDriver),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("No free NBD slots"));
        assert!(!config.paths.sandbox("sbx-a").exists());
        assert_eq!(template.active_leases(), 0);

        // The template device is still usable.
        template.rootfs().await.unwrap().read_at(0, 1).await.unwrap();
        template.close().await.unwrap();
    }
}
