//! Task helpers.

use crate::error::{CinderError, CinderResult};

/// Run blocking work (file I/O, syscalls) on tokio's blocking pool.
///
/// # Errors
///
/// Returns the closure's error, or [`CinderError::Internal`] if the task
/// panicked or was cancelled.
pub async fn blocking<T, F>(f: F) -> CinderResult<T>
where
    F: FnOnce() -> CinderResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CinderError::Internal {
            message: format!("blocking task failed: {e}"),
        })?
}
