//! Amazon S3 (and S3-compatible) backend.
//!
//! Requests are signed with AWS Signature Version 4. Without an access key
//! the bucket is accessed anonymously.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use cinder_common::config::Credentials;
use cinder_common::{CinderError, CinderResult, StorageConfig};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use sha2::{Digest, Sha256};

use crate::http::{
    Attempt, content_length, encode_path, range_header, status_error, transport_error,
    with_retries,
};
use crate::store::ObjectStore;

type HmacSha256 = Hmac<Sha256>;

/// Payload hash for requests without a body.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Payload hash for streamed uploads.
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// An S3 bucket.
pub struct S3Bucket {
    client: Client,
    base: Url,
    bucket: String,
    path_style: bool,
    signer: Option<Signer>,
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("base", &self.base.as_str())
            .field("bucket", &self.bucket)
            .field("path_style", &self.path_style)
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl S3Bucket {
    /// Create a client for the configured bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid URL or the HTTP client
    /// cannot be built.
    pub fn new(config: &StorageConfig) -> CinderResult<Self> {
        let client = Client::builder().build().map_err(|e| CinderError::Config {
            message: format!("failed to build S3 client: {e}"),
        })?;

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region));
        let base = Url::parse(endpoint.trim_end_matches('/')).map_err(|e| CinderError::Config {
            message: format!("invalid S3 endpoint {endpoint}: {e}"),
        })?;

        Ok(Self {
            client,
            base,
            bucket: config.bucket.clone(),
            path_style: config.path_style,
            signer: Signer::from_credentials(&config.credentials, &config.region),
        })
    }

    fn url(&self, path: &str) -> CinderResult<Url> {
        let key = encode_path(path);
        let mut url = self.base.clone();

        if self.path_style {
            url.set_path(&format!("/{}/{key}", self.bucket));
        } else {
            let host = self.base.host_str().unwrap_or_default();
            url.set_host(Some(&format!("{}.{host}", self.bucket)))
                .map_err(|e| CinderError::Config {
                    message: format!("invalid S3 bucket host: {e}"),
                })?;
            url.set_path(&format!("/{key}"));
        }
        Ok(url)
    }

    /// Build a request, signing it when credentials are configured.
    fn request(
        &self,
        method: Method,
        path: &str,
        range: Option<String>,
        payload_hash: &str,
    ) -> CinderResult<RequestBuilder> {
        let url = self.url(path)?;
        let mut headers: Vec<(String, String)> = Vec::new();
        if let Some(range) = range {
            headers.push(("range".to_string(), range));
        }

        if let Some(signer) = &self.signer {
            let host = match url.port() {
                Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
                None => url.host_str().unwrap_or_default().to_string(),
            };
            let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

            headers.push(("x-amz-content-sha256".to_string(), payload_hash.to_string()));
            headers.push(("x-amz-date".to_string(), amz_date.clone()));
            if let Some(token) = &signer.session_token {
                headers.push(("x-amz-security-token".to_string(), token.clone()));
            }

            let mut signed = headers.clone();
            signed.push(("host".to_string(), host));
            let authorization =
                signer.authorization(method.as_str(), url.path(), &signed, payload_hash, &amz_date)?;
            headers.push(("authorization".to_string(), authorization));
        }

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        Ok(request)
    }
}

#[async_trait]
impl ObjectStore for S3Bucket {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn size(&self, path: &str) -> CinderResult<u64> {
        with_retries(path, || async {
            let response = self
                .request(Method::HEAD, path, None, EMPTY_PAYLOAD_SHA256)
                .map_err(Attempt::Fatal)?
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

        tracing::trace!(bucket = %self.bucket, object = path, offset, length, "S3 range read");

        with_retries(path, || async {
            let response = self
                .request(
                    Method::GET,
                    path,
                    Some(range_header(offset, length)),
                    EMPTY_PAYLOAD_SHA256,
                )
                .map_err(Attempt::Fatal)?
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
        with_retries(path, || async {
            let response = self
                .request(Method::PUT, path, None, UNSIGNED_PAYLOAD)
                .map_err(Attempt::Fatal)?
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
        tracing::info!(bucket = %self.bucket, object = path, source = %source.display(), "Uploading to S3");

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
                .request(Method::PUT, path, None, UNSIGNED_PAYLOAD)
                .map_err(Attempt::Fatal)?
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
        with_retries(path, || async {
            let response = self
                .request(Method::DELETE, path, None, EMPTY_PAYLOAD_SHA256)
                .map_err(Attempt::Fatal)?
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

/// SigV4 request signer.
struct Signer {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    region: String,
}

impl Signer {
    fn from_credentials(credentials: &Credentials, region: &str) -> Option<Self> {
        let access_key_id = credentials.access_key_id.clone()?;
        let secret_access_key = credentials.secret_access_key.clone()?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: credentials.session_token.clone(),
            region: region.to_string(),
        })
    }

    /// `Authorization` header value. `headers` must include `host` and use
    /// lowercase names.
    fn authorization(
        &self,
        method: &str,
        uri: &str,
        headers: &[(String, String)],
        payload_hash: &str,
        amz_date: &str,
    ) -> CinderResult<String> {
        let mut headers: Vec<&(String, String)> = headers.iter().collect();
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{method}\n{uri}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let date = amz_date.get(..8).unwrap_or(amz_date);
        let scope = format!("{date}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = hmac(format!("AWS4{}", self.secret_access_key).as_bytes(), date)?;
        let key = hmac(&key, &self.region)?;
        let key = hmac(&key, "s3")?;
        let key = hmac(&key, "aws4_request")?;
        let signature = hex::encode(hmac(&key, &string_to_sign)?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope},SignedHeaders={signed_headers},Signature={signature}",
            self.access_key_id
        ))
    }
}

fn hmac(key: &[u8], data: &str) -> CinderResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| CinderError::Internal {
        message: format!("invalid signing key: {e}"),
    })?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}
