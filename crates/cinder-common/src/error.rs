//! Common error types for the Cinder storage engine.

use std::fmt;
use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CinderError`].
pub type CinderResult<T> = Result<T, CinderError>;

/// Errors produced anywhere in the storage engine.
#[derive(Error, Diagnostic, Debug)]
pub enum CinderError {
    /// A chunk could not be fetched from remote storage.
    #[error("Failed to fetch chunk {chunk} of {object} at offset {offset}: {message}")]
    #[diagnostic(code(cinder::storage::fetch))]
    Fetch {
        /// Remote object path.
        object: String,
        /// Chunk index within the object.
        chunk: u64,
        /// Byte offset of the chunk.
        offset: u64,
        /// Underlying failure.
        message: String,
    },

    /// Remote object does not exist.
    #[error("Object not found: {object}")]
    #[diagnostic(code(cinder::storage::not_found))]
    ObjectNotFound {
        /// Remote object path.
        object: String,
    },

    /// Object storage backend failure.
    #[error("Storage error for {object}: {message}")]
    #[diagnostic(code(cinder::storage::backend))]
    Storage {
        /// Remote object path.
        object: String,
        /// The error message.
        message: String,
    },

    /// Access outside of a device's bounds.
    #[error("Access out of bounds: offset {offset} + length {length} exceeds device size {size}")]
    #[diagnostic(code(cinder::block::out_of_bounds))]
    OutOfBounds {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        length: u64,
        /// Device size.
        size: u64,
    },

    /// The device has already been closed.
    #[error("Device is closed: {device}")]
    #[diagnostic(code(cinder::block::closed))]
    DeviceClosed {
        /// Device description.
        device: String,
    },

    /// Requested bytes have not been written to a write cache.
    #[error("Bytes not available in cache at offset {offset}")]
    #[diagnostic(code(cinder::block::not_available))]
    BytesNotAvailable {
        /// Offset of the first missing block.
        offset: u64,
    },

    /// Every NBD slot in the pool is allocated.
    #[error("No free NBD slots ({capacity} in pool)")]
    #[diagnostic(
        code(cinder::nbd::exhausted),
        help("Release unused sandboxes or raise the nbds_max kernel parameter")
    )]
    NoFreeSlots {
        /// Pool capacity.
        capacity: u32,
    },

    /// The kernel still uses the NBD device. Callers may retry.
    #[error("NBD device {slot} is still in use")]
    #[diagnostic(code(cinder::nbd::in_use))]
    DeviceInUse {
        /// Slot index.
        slot: u32,
    },

    /// Releasing a slot that is not allocated.
    #[error("NBD slot {slot} is not allocated")]
    #[diagnostic(code(cinder::nbd::not_allocated))]
    SlotNotAllocated {
        /// Slot index.
        slot: u32,
    },

    /// A path that does not name an NBD device.
    #[error("Invalid NBD device path: {path}")]
    #[diagnostic(code(cinder::nbd::invalid_path))]
    InvalidDevicePath {
        /// The offending path.
        path: String,
    },

    /// NBD driver failure.
    #[error("NBD error: {message}")]
    #[diagnostic(code(cinder::nbd::driver))]
    Nbd {
        /// The error message.
        message: String,
    },

    /// A set-once value was assigned twice.
    #[error("Value already set")]
    #[diagnostic(code(cinder::once::already_set))]
    AlreadySet,

    /// Operation was cancelled before completion.
    #[error("Operation cancelled: {operation}")]
    #[diagnostic(code(cinder::cancelled))]
    Cancelled {
        /// The cancelled operation.
        operation: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(cinder::io))]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(cinder::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(cinder::unsupported), help("NBD exports require Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// An error with added context.
    #[error("{context}: {source}")]
    #[diagnostic(code(cinder::context))]
    Context {
        /// What was being done.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<CinderError>,
    },

    /// An error shared by every observer of a memoized result.
    #[error(transparent)]
    #[diagnostic(code(cinder::shared))]
    Shared(Arc<CinderError>),

    /// Several independent failures, typically from cleanup.
    #[error("{}", JoinedDisplay(.0))]
    #[diagnostic(code(cinder::multiple))]
    Multiple(Vec<CinderError>),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(cinder::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

struct JoinedDisplay<'a>(&'a [CinderError]);

impl fmt::Display for JoinedDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl CinderError {
    /// Wrap this error with a description of the failed operation.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Join cleanup errors: `Ok` when empty, the error itself when there is one.
    ///
    /// # Errors
    ///
    /// Returns every collected error.
    pub fn join(mut errors: Vec<CinderError>) -> CinderResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Whether this error, or any error it wraps, reports a busy NBD device.
    #[must_use]
    pub fn is_device_in_use(&self) -> bool {
        match self {
            Self::DeviceInUse { .. } => true,
            Self::Context { source, .. } => source.is_device_in_use(),
            Self::Shared(inner) => inner.is_device_in_use(),
            _ => false,
        }
    }

    /// Whether this error, or any error it wraps, is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Context { source, .. } => source.is_cancelled(),
            Self::Shared(inner) => inner.is_cancelled(),
            _ => false,
        }
    }
}

/// Attach context to fallible results.
pub trait ResultExt<T> {
    /// Wrap the error with `context`.
    ///
    /// # Errors
    ///
    /// Returns the wrapped error.
    fn context(self, context: impl Into<String>) -> CinderResult<T>;

    /// Wrap the error with a lazily built context.
    ///
    /// # Errors
    ///
    /// Returns the wrapped error.
    fn with_context<F, S>(self, f: F) -> CinderResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<CinderError>,
{
    fn context(self, context: impl Into<String>) -> CinderResult<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> CinderResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CinderError::NoFreeSlots { capacity: 4 };
        assert_eq!(err.to_string(), "No free NBD slots (4 in pool)");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CinderError = io_err.into();
        assert!(matches!(err, CinderError::Io(_)));
    }

    #[test]
    fn join_empty_is_ok() {
        assert!(CinderError::join(Vec::new()).is_ok());
    }

    #[test]
    fn join_single_returns_it() {
        let err = CinderError::join(vec![CinderError::AlreadySet]).unwrap_err();
        assert!(matches!(err, CinderError::AlreadySet));
    }

    #[test]
    fn join_multiple_lists_each() {
        let err = CinderError::join(vec![
            CinderError::DeviceInUse { slot: 3 },
            CinderError::SlotNotAllocated { slot: 5 },
        ])
        .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @r"
        NBD device 3 is still in use
        NBD slot 5 is not allocated
        ");
    }

    #[test]
    fn device_in_use_seen_through_wrappers() {
        let err = CinderError::DeviceInUse { slot: 1 }.context("releasing overlay device");
        assert!(err.is_device_in_use());

        let shared = CinderError::Shared(Arc::new(err));
        assert!(shared.is_device_in_use());

        assert!(!CinderError::NoFreeSlots { capacity: 1 }.is_device_in_use());
    }

    #[test]
    fn context_prefixes_message() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk full"));
        let err = result.context("writing chunk 7").unwrap_err();
        assert_eq!(err.to_string(), "writing chunk 7: I/O error: disk full");
    }
}
