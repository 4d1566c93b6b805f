//! Remote object storage capability.
//!
//! Every backend offers the same small contract: byte-range reads by object
//! path, object length lookup, and whole-object or streamed writes. The
//! backend is chosen once from [`StorageConfig`], so the storage engine never
//! branches on the cloud provider.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cinder_common::{CinderError, CinderResult, Provider, StorageConfig};

use crate::gcs::GcsBucket;
use crate::local::LocalBucket;
use crate::s3::S3Bucket;

/// A bucket of immutable objects addressed by path.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Bucket name, for logs and errors.
    fn name(&self) -> &str;

    /// Length of an object in bytes.
    async fn size(&self, path: &str) -> CinderResult<u64>;

    /// Read `length` bytes starting at `offset`.
    ///
    /// The result is shorter than `length` only when the range extends past
    /// the end of the object.
    async fn read_range(&self, path: &str, offset: u64, length: u64) -> CinderResult<Bytes>;

    /// Replace an object with `data`.
    async fn write(&self, path: &str, data: Bytes) -> CinderResult<()>;

    /// Stream a local file into an object.
    async fn upload(&self, path: &str, source: &Path) -> CinderResult<()>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, path: &str) -> CinderResult<()>;
}

/// Open the bucket described by `config`.
///
/// # Errors
///
/// Returns an error if the configuration is incomplete for the provider.
pub fn open_bucket(config: &StorageConfig) -> CinderResult<Arc<dyn ObjectStore>> {
    if config.bucket.is_empty() {
        return Err(CinderError::Config {
            message: "storage bucket is not configured".to_string(),
        });
    }

    tracing::debug!(
        provider = ?config.provider,
        bucket = %config.bucket,
        "Opening template bucket"
    );

    let store: Arc<dyn ObjectStore> = match config.provider {
        Provider::Gcs => Arc::new(GcsBucket::new(config)?),
        Provider::S3 => Arc::new(S3Bucket::new(config)?),
        Provider::Local => Arc::new(LocalBucket::new(&config.bucket)),
    };

    Ok(store)
}
