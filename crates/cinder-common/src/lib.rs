//! # cinder-common
//!
//! Shared utilities and types for the Cinder sandbox storage engine.
//!
//! This crate provides common functionality used across all Cinder crates:
//! - The error taxonomy
//! - Engine configuration
//! - Standard filesystem paths
//! - Sandbox and cache identifiers
//! - Set-once cells for memoized resolution
//! - Running blocking work off the async workers

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod id;
pub mod once;
pub mod paths;
pub mod task;

pub use config::{CinderConfig, NbdConfig, Provider, ReleasePolicy, RetryMode, StorageConfig};
pub use error::{CinderError, CinderResult, ResultExt};
pub use id::SandboxId;
pub use once::SetOnce;
pub use paths::CinderPaths;
pub use task::blocking;
