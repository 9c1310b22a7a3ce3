//! Error types and result alias for the lock protocol.
//!
//! The protocol classifies store failures into three buckets: a
//! distinguished not-found signal, a distinguished precondition-failed
//! signal (CAS rejection), and an opaque remainder. Everything else in
//! this enum is a lock-level outcome layered on top of those.

use std::fmt;
use std::time::Duration;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the lock client and the object-store seam.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The object is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A CAS condition did not hold (conventionally HTTP 412).
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed condition.
        message: String,
    },

    /// Any other store failure; treated as transient by the protocol.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The lease is irrevocably gone. The caller must stop any work that
    /// depended on holding the lock.
    #[error("lock abandoned")]
    Abandoned,

    /// The lock object on the store names a different owner.
    #[error("unable to release lock owned by someone else")]
    OwnedByOther,

    /// The acquisition deadline passed. Carries every per-attempt failure
    /// observed along the way.
    #[error("lock on {path} not acquired within {timeout:?}: {attempts}")]
    DeadlineExceeded {
        /// Path of the contended lock object.
        path: String,
        /// The caller-supplied acquisition timeout.
        timeout: Duration,
        /// The failures accumulated before the deadline.
        attempts: AttemptErrors,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// The failures accumulated across an acquisition loop, in order.
#[derive(Debug, Default)]
pub struct AttemptErrors(Vec<Error>);

impl AttemptErrors {
    /// Returns the number of recorded attempts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether any attempt was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the recorded attempt errors, oldest first.
    #[must_use]
    pub fn as_slice(&self) -> &[Error] {
        &self.0
    }
}

impl From<Vec<Error>> for AttemptErrors {
    fn from(errors: Vec<Error>) -> Self {
        Self(errors)
    }
}

impl fmt::Display for AttemptErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no attempts were made");
        }
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
