//! Shared plumbing for the HTTP object storage clients.

use std::future::Future;
use std::time::Duration;

use cinder_common::{CinderError, CinderResult};
use reqwest::{Response, StatusCode};

/// Retries after the first attempt.
pub(crate) const MAX_RETRIES: u32 = 3;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of one request attempt.
pub(crate) enum Attempt {
    /// Worth trying again.
    Transient(CinderError),
    /// Retrying cannot help.
    Fatal(CinderError),
}

/// Run `op` until it succeeds, fails fatally, or the retry budget is spent.
pub(crate) async fn with_retries<T, F, Fut>(object: &str, mut op: F) -> CinderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut retries = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(err)) => return Err(err),
            Err(Attempt::Transient(err)) if retries >= MAX_RETRIES => return Err(err),
            Err(Attempt::Transient(err)) => {
                retries += 1;
                tracing::debug!(object, retries, error = %err, "Retrying storage request");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

/// Classify a transport error.
pub(crate) fn transport_error(object: &str, err: &reqwest::Error) -> Attempt {
    let wrapped = CinderError::Storage {
        object: object.to_string(),
        message: format!("request failed: {err}"),
    };

    if err.is_timeout() || err.is_connect() || err.is_request() {
        Attempt::Transient(wrapped)
    } else {
        Attempt::Fatal(wrapped)
    }
}

/// Turn a non-success response into an error, reading its body for context.
pub(crate) async fn status_error(object: &str, response: Response) -> Attempt {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Attempt::Fatal(CinderError::ObjectNotFound {
            object: object.to_string(),
        });
    }

    let body = response.text().await.unwrap_or_default();
    let err = CinderError::Storage {
        object: object.to_string(),
        message: format!("unexpected status {status}: {}", body.trim()),
    };

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Attempt::Transient(err)
    } else {
        Attempt::Fatal(err)
    }
}

/// Parse the `Content-Length` header of a HEAD response.
pub(crate) fn content_length(object: &str, response: &Response) -> Result<u64, Attempt> {
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            Attempt::Fatal(CinderError::Storage {
                object: object.to_string(),
                message: "missing Content-Length".to_string(),
            })
        })
}

/// `Range` header value for `length` bytes at `offset`. `length` must be non-zero.
pub(crate) fn range_header(offset: u64, length: u64) -> String {
    format!("bytes={}-{}", offset, offset + length - 1)
}

/// Percent-encode an object path, keeping `/` separators.
pub(crate) fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b'/') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn encodes_reserved_characters() {
        assert_eq!(encode_path("build/rootfs.ext4"), "build/rootfs.ext4");
        assert_eq!(encode_path("a b/c+d"), "a%20b/c%2Bd");
    }

    #[test]
    fn range_is_inclusive() {
        assert_eq!(range_header(4096, 4096), "bytes=4096-8191");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retries("obj", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Attempt::Transient(CinderError::Internal {
                        message: "flaky".to_string(),
                    }))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: CinderResult<()> = with_retries("obj", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Attempt::Transient(CinderError::Internal {
                    message: "down".to_string(),
                }))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: CinderResult<()> = with_retries("obj", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Attempt::Fatal(CinderError::ObjectNotFound {
                    object: "obj".to_string(),
                }))
            }
        })
        .await;

        assert!(matches!(result, Err(CinderError::ObjectNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
