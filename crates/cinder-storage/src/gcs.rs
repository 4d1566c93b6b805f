//! Google Cloud Storage backend.
//!
//! Talks to the XML endpoint (`<endpoint>/<bucket>/<object>`), which serves
//! ranged GETs, HEADs and PUT uploads with plain HTTP semantics.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use cinder_common::{CinderError, CinderResult, StorageConfig};
use reqwest::{Client, RequestBuilder, StatusCode};

use crate::http::{
    Attempt, content_length, encode_path, range_header, status_error, transport_error,
    with_retries,
};
use crate::store::ObjectStore;

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// A GCS bucket.
pub struct GcsBucket {
    client: Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

impl std::fmt::Debug for GcsBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsBucket")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl GcsBucket {
    /// Create a client for the configured bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &StorageConfig) -> CinderResult<Self> {
        let client = Client::builder().build().map_err(|e| CinderError::Config {
            message: format!("failed to build GCS client: {e}"),
        })?;

        let endpoint = config
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            endpoint,
            bucket: config.bucket.clone(),
            token: config.credentials.access_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, encode_path(path))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for GcsBucket {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn size(&self, path: &str) -> CinderResult<u64> {
        let url = self.url(path);
        with_retries(path, || async {
            let response = self
                .authorized(self.client.head(&url))
                .send()
                .await
                .map_err(|e| transport_error(path, &e))?;

            if !response.status().is_success() {
                return Err(status_error(path, response).await);
            }
            content_length(path, &response)
        })
        .await
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> CinderResult<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }

        let url = self.url(path);
        tracing::trace!(bucket = %self.bucket, object = path, offset, length, "GCS range read");

        with_retries(path, || async {
            let response = self
                .authorized(self.client.get(&url))
                .header(reqwest::header::RANGE, range_header(offset, length))
                .send()
                .await
                .map_err(|e| transport_error(path, &e))?;

            match response.status() {
                StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
                StatusCode::RANGE_NOT_SATISFIABLE => return Ok(Bytes::new()),
                _ => return Err(status_error(path, response).await),
            }

            response
                .bytes()
                .await
                .map_err(|e| transport_error(path, &e))
        })
        .await
    }

    async fn write(&self, path: &str, data: Bytes) -> CinderResult<()> {
        let url = self.url(path);
        with_retries(path, || async {
            let response = self
                .authorized(self.client.put(&url))
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(data.clone())
                .send()
                .await
                .map_err(|e| transport_error(path, &e))?;

            if !response.status().is_success() {
                return Err(status_error(path, response).await);
            }
            Ok(())
        })
        .await
    }

    async fn upload(&self, path: &str, source: &Path) -> CinderResult<()> {
        let url = self.url(path);
        tracing::info!(bucket = %self.bucket, object = path, source = %source.display(), "Uploading to GCS");

        with_retries(path, || async {
            let file = tokio::fs::File::open(source)
                .await
                .map_err(|e| Attempt::Fatal(e.into()))?;
            let len = file
                .metadata()
                .await
                .map_err(|e| Attempt::Fatal(e.into()))?
                .len();

            let response = self
                .authorized(self.client.put(&url))
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .header(reqwest::header::CONTENT_LENGTH, len)
                .body(reqwest::Body::from(file))
                .send()
                .await
                .map_err(|e| transport_error(path, &e))?;

            if !response.status().is_success() {
                return Err(status_error(path, response).await);
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, path: &str) -> CinderResult<()> {
        let url = self.url(path);
        with_retries(path, || async {
            let response = self
                .authorized(self.client.delete(&url))
                .send()
                .await
                .map_err(|e| transport_error(path, &e))?;

            if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
                return Ok(());
            }
            Err(status_error(path, response).await)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_urls() {
        let config = StorageConfig {
            bucket: "e2e-templates".to_string(),
            endpoint: Some("http://localhost:4443/".to_string()),
            ..StorageConfig::default()
        };
        let bucket = GcsBucket::new(&config).unwrap();
        assert_eq!(
            bucket.url("build-1/rootfs.ext4"),
            "http://localhost:4443/e2e-templates/build-1/rootfs.ext4"
        );
    }

    #[test]
    fn default_endpoint() {
        let config = StorageConfig {
            bucket: "templates".to_string(),
            ..StorageConfig::default()
        };
        let bucket = GcsBucket::new(&config).unwrap();
        assert_eq!(
            bucket.url("b/memfile"),
            "https://storage.googleapis.com/templates/b/memfile"
        );
    }
}
