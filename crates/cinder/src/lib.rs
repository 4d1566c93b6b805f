//! # Cinder
//!
//! Cinder serves the block storage of microVM sandboxes: template artifacts
//! are fetched lazily from object storage, shared between sandboxes, and
//! layered under private copy-on-write overlays exported as NBD devices.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cinder::{SandboxRootfs, TemplateCache, TemplateKey};
//! use cinder_common::{CinderConfig, SandboxId};
//! use cinder_nbd::{DevicePool, KernelDriver};
//! use cinder_storage::{TemplateFiles, open_bucket};
//!
//! # async fn example() -> cinder_common::CinderResult<()> {
//! let config = CinderConfig::default();
//! let cache = TemplateCache::new(open_bucket(&config.storage)?, config.paths.templates());
//!
//! let files = TemplateFiles::new("base", "build-1", "vmlinux-6.1.102", "v1.10.1")?;
//! let template = cache.get_or_fetch(TemplateKey::new(files, false))?;
//!
//! let rootfs = SandboxRootfs::start(
//!     SandboxId::generate(),
//!     &template,
//!     &config,
//!     Arc::new(DevicePool::from_config(&config.nbd)),
//!     Arc::new(KernelDriver::new(&config.nbd)),
//! )
//! .await?;
//! println!("{}", rootfs.path().await?.display());
//!
//! rootfs.close().await?;
//! cache.close_all().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod cow;
pub mod sandbox;
pub mod template;

pub use cow::CowDevice;
pub use sandbox::SandboxRootfs;
pub use template::{LocalFile, Template, TemplateCache, TemplateKey};
