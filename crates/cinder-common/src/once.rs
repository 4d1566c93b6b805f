//! Single-assignment cells shared between a producer and many waiters.
//!
//! A [`SetOnce`] is resolved exactly once, with either a value or an error.
//! Every waiter, whether it started waiting before or after resolution,
//! observes the same outcome. Errors are shared through an [`Arc`] so all
//! observers see the identical failure.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{CinderError, CinderResult};

type Outcome<T> = Result<T, Arc<CinderError>>;

/// A value that is resolved at most once.
pub struct SetOnce<T> {
    tx: watch::Sender<Option<Outcome<T>>>,
}

impl<T: Clone> SetOnce<T> {
    /// Create an unresolved cell.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Resolve with a value.
    ///
    /// # Errors
    ///
    /// Returns [`CinderError::AlreadySet`] if the cell was already resolved.
    pub fn set_value(&self, value: T) -> CinderResult<()> {
        self.set(Ok(value))
    }

    /// Resolve with an error.
    ///
    /// # Errors
    ///
    /// Returns [`CinderError::AlreadySet`] if the cell was already resolved.
    pub fn set_error(&self, err: CinderError) -> CinderResult<()> {
        self.set(Err(Arc::new(err)))
    }

    fn set(&self, outcome: Outcome<T>) -> CinderResult<()> {
        let mut pending = Some(outcome);
        let stored = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = pending.take();
            true
        });

        if stored {
            Ok(())
        } else {
            Err(CinderError::AlreadySet)
        }
    }

    /// Wait until the cell is resolved and return its outcome.
    ///
    /// # Errors
    ///
    /// Returns the stored error, wrapped in [`CinderError::Shared`].
    pub async fn wait(&self) -> CinderResult<T> {
        let mut rx = self.tx.subscribe();
        let resolved = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CinderError::Internal {
                message: "set-once sender dropped while waiting".to_string(),
            })?;

        match resolved.as_ref() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(err)) => Err(CinderError::Shared(Arc::clone(err))),
            None => Err(CinderError::Internal {
                message: "set-once resolved without a value".to_string(),
            }),
        }
    }

    /// The outcome if already resolved, without waiting.
    #[must_use]
    pub fn get(&self) -> Option<CinderResult<T>> {
        self.tx.borrow().as_ref().map(|outcome| match outcome {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(CinderError::Shared(Arc::clone(err))),
        })
    }

    /// Whether the cell has been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl<T: Clone> Default for SetOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SetOnce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.tx.borrow().as_ref() {
            None => "pending",
            Some(Ok(_)) => "value",
            Some(Err(_)) => "error",
        };
        f.debug_struct("SetOnce").field("state", &state).finish()
    }
}
