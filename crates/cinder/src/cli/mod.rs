//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cinder_block::ReadonlyDevice;
use cinder_common::{CinderConfig, Provider, SandboxId};
use cinder_nbd::{DevicePool, KernelDriver, SlotProbe, SysfsProbe, kernel_pool_capacity, pool_capacity};
use cinder_storage::{ArtifactKind, ObjectStore, TemplateFiles, TemplateUpload, UploadSources, open_bucket};
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use tokio::io::AsyncWriteExt;

use crate::sandbox::SandboxRootfs;
use crate::template::{TemplateCache, TemplateKey};

/// Cinder - sandbox block storage engine
#[derive(Parser)]
#[command(name = "cinder")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for cinder data
    #[arg(long, global = true, env = "CINDER_ROOT")]
    pub root: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "CINDER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Object storage provider (gcs, s3, local)
    #[arg(long, global = true, env = "CLOUD_PROVIDER")]
    pub provider: Option<Provider>,

    /// Bucket holding template artifacts (a directory for `local`)
    #[arg(long, global = true, env = "TEMPLATE_BUCKET_NAME")]
    pub bucket: Option<String>,

    /// Object storage endpoint override
    #[arg(long, global = true, env = "STORAGE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// S3 region
    #[arg(long, global = true, env = "AWS_REGION")]
    pub region: Option<String>,

    /// S3 access key ID
    #[arg(long, global = true, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key_id: Option<String>,

    /// S3 secret access key
    #[arg(long, global = true, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: Option<String>,

    /// S3 session token
    #[arg(long, global = true, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    pub session_token: Option<String>,

    /// GCS OAuth access token
    #[arg(long, global = true, env = "GCS_ACCESS_TOKEN", hide_env_values = true)]
    pub gcs_access_token: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Coordinates of a template build.
#[derive(Args, Debug, Clone)]
pub struct TemplateArgs {
    /// Template ID
    pub template_id: String,

    /// Build ID
    pub build_id: String,

    /// Guest kernel version
    #[arg(long, default_value = "vmlinux-6.1.102")]
    pub kernel_version: String,

    /// Firecracker version
    #[arg(long, default_value = "v1.10.1")]
    pub firecracker_version: String,

    /// The template's memory is backed by huge pages
    #[arg(long)]
    pub hugepages: bool,
}

impl TemplateArgs {
    fn key(&self) -> Result<TemplateKey> {
        let files = TemplateFiles::new(
            &self.template_id,
            &self.build_id,
            &self.kernel_version,
            &self.firecracker_version,
        )?;
        Ok(TemplateKey::new(files, self.hugepages))
    }
}

/// Cinder commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Fetch a template and print a summary
    Fetch {
        #[command(flatten)]
        template: TemplateArgs,

        /// Keep the local cache files
        #[arg(long)]
        keep: bool,
    },

    /// Read a byte range of a template artifact
    Read {
        #[command(flatten)]
        template: TemplateArgs,

        /// Artifact to read (memfile, rootfs, snapfile)
        #[arg(short, long)]
        artifact: ArtifactKind,

        /// Byte offset
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Number of bytes (default: to the end)
        #[arg(long)]
        length: Option<u64>,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Export a sandbox rootfs as an NBD device
    Mount {
        #[command(flatten)]
        template: TemplateArgs,

        /// Sandbox ID (default: generated)
        #[arg(long)]
        sandbox_id: Option<SandboxId>,

        /// Copy the device to this file once it is up
        #[arg(long)]
        export: Option<PathBuf>,

        /// Tear down after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        keep_alive: Option<u64>,
    },

    /// Upload template build artifacts
    Upload {
        #[command(flatten)]
        template: TemplateArgs,

        /// Snapshot metadata file
        #[arg(long)]
        snapfile: Option<PathBuf>,

        /// Memory snapshot file
        #[arg(long)]
        memfile: Option<PathBuf>,

        /// Root filesystem image
        #[arg(long)]
        rootfs: Option<PathBuf>,
    },

    /// Show NBD device pool status
    Pool {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

impl Cli {
    /// Build the engine configuration from the config file and flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn engine_config(&self) -> Result<CinderConfig> {
        let mut config = match &self.config {
            Some(path) => CinderConfig::from_file(path)?,
            None => CinderConfig::default(),
        };

        if let Some(root) = &self.root {
            config = config.with_root(root);
        }

        let storage = &mut config.storage;
        if let Some(provider) = self.provider {
            storage.provider = provider;
        }
        if let Some(bucket) = &self.bucket {
            storage.bucket.clone_from(bucket);
        }
        if self.endpoint.is_some() {
            storage.endpoint.clone_from(&self.endpoint);
        }
        if let Some(region) = &self.region {
            storage.region.clone_from(region);
        }

        let credentials = &mut storage.credentials;
        for (flag, slot) in [
            (&self.gcs_access_token, &mut credentials.access_token),
            (&self.access_key_id, &mut credentials.access_key_id),
            (&self.secret_access_key, &mut credentials.secret_access_key),
            (&self.session_token, &mut credentials.session_token),
        ] {
            if flag.is_some() {
                slot.clone_from(flag);
            }
        }

        Ok(config)
    }

    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = self.engine_config()?;

        match self.command {
            Commands::Fetch { template, keep } => fetch(&config, &template, keep).await,

            Commands::Read {
                template,
                artifact,
                offset,
                length,
                output,
            } => read(&config, &template, artifact, offset, length, output.as_deref()).await,

            Commands::Mount {
                template,
                sandbox_id,
                export,
                keep_alive,
            } => {
                mount(
                    &config,
                    &template,
                    sandbox_id.unwrap_or_else(SandboxId::generate),
                    export.as_deref(),
                    keep_alive.map(Duration::from_secs),
                )
                .await
            }

            Commands::Upload {
                template,
                snapfile,
                memfile,
                rootfs,
            } => {
                let store = open_bucket(&config.storage)?;
                let files = template.key()?.files;
                let sources = UploadSources {
                    snapfile,
                    memfile,
                    rootfs,
                };

                TemplateUpload::new(store, files.clone())
                    .upload(&sources)
                    .await
                    .wrap_err_with(|| format!("Failed to upload template {files}"))?;

                println!("Uploaded template {files}");
                Ok(())
            }

            Commands::Pool { format } => pool(&config, &format),
        }
    }
}

fn template_cache(config: &CinderConfig) -> Result<(Arc<dyn ObjectStore>, TemplateCache)> {
    let store = open_bucket(&config.storage)?;
    let cache = TemplateCache::new(Arc::clone(&store), config.paths.templates());
    Ok((store, cache))
}

async fn fetch(config: &CinderConfig, args: &TemplateArgs, keep: bool) -> Result<()> {
    let (store, cache) = template_cache(config)?;
    let key = args.key()?;
    let template = cache.get_or_fetch(key.clone())?;

    let summary = async {
        let memfile = template.memfile().await.wrap_err("Failed to fetch memfile")?;
        let rootfs = template.rootfs().await.wrap_err("Failed to fetch rootfs")?;
        let snapfile = template.snapfile().await.wrap_err("Failed to fetch snapfile")?;

        Ok::<_, color_eyre::Report>(serde_json::json!({
            "bucket": store.name(),
            "template_id": key.files.template_id,
            "build_id": key.files.build_id,
            "cache_identifier": cache.cache_identifier(),
            "cache_dir": template.cache_files().cache_dir(),
            "page_size": template.page_size(),
            "memfile": { "object": memfile.object(), "size": memfile.size() },
            "rootfs": { "object": rootfs.object(), "size": rootfs.size() },
            "snapfile": { "path": snapfile.path(), "size": snapfile.size() },
        }))
    }
    .await;

    // A failed fetch never keeps its partial cache.
    if !keep || summary.is_err() {
        cache.close_all().await?;
    }
    println!("{}", serde_json::to_string_pretty(&summary?)?);
    Ok(())
}

async fn read(
    config: &CinderConfig,
    args: &TemplateArgs,
    artifact: ArtifactKind,
    offset: u64,
    length: Option<u64>,
    output: Option<&Path>,
) -> Result<()> {
    let (_store, cache) = template_cache(config)?;
    let template = cache.get_or_fetch(args.key()?)?;

    let result = async {
        let data = match artifact {
            ArtifactKind::Memfile | ArtifactKind::Rootfs => {
                let device = if artifact == ArtifactKind::Memfile {
                    template.memfile().await?
                } else {
                    template.rootfs().await?
                };
                let length = length.unwrap_or_else(|| device.size().saturating_sub(offset));
                device.read_at(offset, length).await?.to_vec()
            }
            ArtifactKind::Snapfile => {
                let snapfile = template.snapfile().await?;
                let mut content = tokio::fs::read(snapfile.path()).await?;
                let total = content.len() as u64;
                let end = length.map_or(total, |length| offset.saturating_add(length).min(total));
                content.truncate(usize::try_from(end)?);
                content.drain(..usize::try_from(offset.min(end))?);
                content
            }
        };

        match output {
            Some(path) => tokio::fs::write(path, &data)
                .await
                .wrap_err_with(|| format!("Failed to write {}", path.display()))?,
            None => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
        }
        Ok::<_, color_eyre::Report>(())
    }
    .await;

    let closed = cache.close_all().await;
    result.wrap_err_with(|| format!("Failed to read {artifact} of {}", template.files()))?;
    closed?;
    Ok(())
}

async fn mount(
    config: &CinderConfig,
    args: &TemplateArgs,
    sandbox_id: SandboxId,
    export: Option<&Path>,
    keep_alive: Option<Duration>,
) -> Result<()> {
    let (_store, cache) = template_cache(config)?;
    let template = cache.get_or_fetch(args.key()?)?;

    let pool = Arc::new(DevicePool::from_config(&config.nbd));
    let driver = Arc::new(KernelDriver::new(&config.nbd));

    let rootfs = match SandboxRootfs::start(sandbox_id, &template, config, pool, driver).await {
        Ok(rootfs) => rootfs,
        Err(e) => {
            cache.close_all().await?;
            return Err(e).wrap_err("Failed to start sandbox rootfs");
        }
    };

    let path = rootfs.path().await?;
    println!("{}", path.display());

    let exported = match export {
        Some(target) => rootfs.device().export(target).await.map(|()| {
            println!("Exported to {}", target.display());
        }),
        None => Ok(()),
    };

    if exported.is_ok() {
        match keep_alive {
            Some(duration) => tokio::time::sleep(duration).await,
            None => {
                tokio::signal::ctrl_c().await?;
            }
        }
    }

    let closed = rootfs.close().await;
    let evicted = cache.close_all().await;
    exported.wrap_err("Failed to export device")?;
    closed.wrap_err("Failed to tear down sandbox rootfs")?;
    evicted?;
    Ok(())
}

fn pool(config: &CinderConfig, format: &str) -> Result<()> {
    let kernel = kernel_pool_capacity().ok();
    let capacity = pool_capacity(&config.nbd, kernel);
    let probe = SysfsProbe::new(&config.nbd.sys_block_dir);

    let mut busy = Vec::new();
    for slot in 0..capacity {
        if probe.in_use(slot)? {
            busy.push(slot);
        }
    }

    match format {
        "json" => {
            let status = serde_json::json!({
                "configured": config.nbd.pool_size,
                "kernel": kernel,
                "capacity": capacity,
                "busy": busy,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "table" => {
            println!("CONFIGURED\tKERNEL\tCAPACITY\tBUSY");
            println!(
                "{}\t{}\t{}\t{}",
                config.nbd.pool_size,
                kernel.map_or_else(|| "-".to_string(), |k| k.to_string()),
                capacity,
                busy.len()
            );
        }
        other => return Err(eyre!("Unknown output format: {other}")),
    }
    Ok(())
}
