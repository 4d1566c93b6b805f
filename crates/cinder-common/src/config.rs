//! Engine configuration.
//!
//! Built once at process startup (from a TOML file and command-line flags)
//! and handed to constructors. Nothing below the CLI reads the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CinderError, CinderResult};
use crate::paths::CinderPaths;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CinderConfig {
    /// Filesystem layout.
    pub paths: CinderPaths,
    /// Remote object storage.
    pub storage: StorageConfig,
    /// Kernel NBD settings.
    pub nbd: NbdConfig,
    /// NBD slot release behaviour on sandbox teardown.
    pub release: ReleasePolicy,
}

impl CinderConfig {
    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> CinderResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CinderError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_toml(content: &str) -> CinderResult<Self> {
        toml::from_str(content).map_err(|e| CinderError::Config {
            message: format!("invalid configuration: {e}"),
        })
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = CinderPaths::with_root(root);
        self
    }
}

/// Which object storage backend holds template artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Google Cloud Storage.
    #[default]
    Gcs,
    /// Amazon S3 or an S3-compatible service.
    S3,
    /// A local directory standing in for a bucket.
    Local,
}

impl std::str::FromStr for Provider {
    type Err = CinderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gcs" | "gcp" => Ok(Self::Gcs),
            "s3" | "aws" => Ok(Self::S3),
            "local" => Ok(Self::Local),
            other => Err(CinderError::Config {
                message: format!("unknown storage provider: {other}"),
            }),
        }
    }
}

/// Remote object storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selection.
    pub provider: Provider,
    /// Bucket name, or the bucket directory for the local provider.
    pub bucket: String,
    /// Endpoint override (emulators, S3-compatible services).
    pub endpoint: Option<String>,
    /// Region (S3 only).
    pub region: String,
    /// Use path-style addressing (S3 only).
    pub path_style: bool,
    /// Access credentials.
    pub credentials: Credentials,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            bucket: String::new(),
            endpoint: None,
            region: "us-east-1".to_string(),
            path_style: false,
            credentials: Credentials::default(),
        }
    }
}

/// Object storage credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// OAuth bearer token (GCS).
    pub access_token: Option<String>,
    /// Access key ID (S3).
    pub access_key_id: Option<String>,
    /// Secret access key (S3).
    pub secret_access_key: Option<String>,
    /// Session token (S3, temporary credentials).
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("access_token", &redact(&self.access_token))
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redact(&self.secret_access_key))
            .field("session_token", &redact(&self.session_token))
            .finish()
    }
}

/// Kernel NBD settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NbdConfig {
    /// Number of `/dev/nbdN` slots the pool hands out.
    pub pool_size: u32,
    /// Directory containing the device nodes.
    pub dev_dir: PathBuf,
    /// sysfs block directory used to detect busy devices.
    pub sys_block_dir: PathBuf,
    /// Block size announced to the kernel.
    pub block_size: u64,
    /// How long to wait for an export to become live, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Kernel request timeout, in seconds (0 disables).
    pub io_timeout_secs: u64,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            dev_dir: PathBuf::from("/dev"),
            sys_block_dir: PathBuf::from("/sys/block"),
            block_size: 4096,
            connect_timeout_ms: 10_000,
            io_timeout_secs: 0,
        }
    }
}

impl NbdConfig {
    /// Export readiness timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// How many times a busy NBD slot release is retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum RetryMode {
    /// Retry until the kernel lets go of the device.
    #[default]
    Unbounded,
    /// Give up after `max_attempts` and report the device as still in use.
    Bounded {
        /// Total release attempts.
        max_attempts: u32,
    },
}

/// NBD slot release behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleasePolicy {
    /// Retry bound.
    pub retry: RetryMode,
    /// Pause between attempts, in milliseconds (0 only yields).
    pub interval_ms: u64,
    /// Log a warning every this many busy attempts.
    pub log_every: u32,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self {
            retry: RetryMode::Unbounded,
            interval_ms: 0,
            log_every: 100,
        }
    }
}

impl ReleasePolicy {
    /// Bounded policy with the given attempt budget.
    #[must_use]
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            retry: RetryMode::Bounded { max_attempts },
            ..Self::default()
        }
    }

    /// Pause between attempts.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    #[must_use]
    pub const fn allows_retry(&self, attempts: u32) -> bool {
        match self.retry {
            RetryMode::Unbounded => true,
            RetryMode::Bounded { max_attempts } => attempts < max_attempts,
        }
    }
}
