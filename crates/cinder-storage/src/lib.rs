//! # cinder-storage
//!
//! Remote object storage for Cinder templates.
//!
//! This crate provides:
//! - The [`ObjectStore`] capability and its GCS, S3, local and in-memory variants
//! - The template artifact key layout, remote and local
//! - Publishing template build artifacts

#![warn(missing_docs)]

/// Google Cloud Storage backend.
pub mod gcs;
mod http;
pub mod local;
pub mod memory;
pub mod s3;
pub mod store;
pub mod template;
pub mod upload;

pub use gcs::GcsBucket;
pub use local::LocalBucket;
pub use memory::MemoryBucket;
pub use s3::S3Bucket;
pub use store::{ObjectStore, open_bucket};
pub use template::{ArtifactKind, TemplateCacheFiles, TemplateFiles};
pub use upload::{TemplateUpload, UploadSources};
