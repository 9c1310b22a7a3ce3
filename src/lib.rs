//! # distlock
//!
//! A distributed mutual-exclusion lock for cooperating processes that
//! share a consistent object store (such as a cloud blob service) but do
//! not talk to each other. A lock is named by an object path; at most one
//! process holds a given lock at any instant.
//!
//! The algorithm needs only the store's conditional create, conditional
//! metadata update, and conditional delete, keyed to the per-object
//! `generation`/`metageneration` counters, plus an owner-inscribed lease
//! expiry that lets a dead holder's lock be reaped. See [`lock`] for the
//! protocol and [`store`] for the capability the store must provide.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use distlock::{Error, Lock};
//!
//! let store = Arc::new(my_gcs_adapter); // any ObjectStore implementation
//! let lock = Arc::new(Lock::new(
//!     store,
//!     "pod-1234",
//!     "path/to/file.lock",
//!     Duration::from_secs(300),
//! ));
//!
//! lock.acquire(Duration::from_secs(30)).await?;
//!
//! // Refresh on a cadence well under the TTL. An abandoned lease means
//! // the lock is gone: stop the work that depended on it.
//! let refresher = Arc::clone(&lock);
//! tokio::spawn(async move {
//!     let mut ticker = tokio::time::interval(Duration::from_secs(2));
//!     loop {
//!         ticker.tick().await;
//!         if let Err(err) = refresher.refresh().await {
//!             if matches!(err, Error::Abandoned) {
//!                 shutdown.cancel();
//!                 return;
//!             }
//!             tracing::warn!(error = %err, "failed to refresh the lock");
//!         }
//!     }
//! });
//!
//! // ... exclusive work ...
//!
//! lock.release().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod lock;
pub mod observability;
pub mod store;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use distlock::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{AttemptErrors, Error, Result};
    pub use crate::lock::{Lock, EXPIRES_AT_KEY, MAX_REFRESH_FAILURES, OWNER_KEY};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::store::{MemoryStore, ObjectAttrs, ObjectStore};
}

// Re-export key types at crate root for ergonomics
pub use error::{AttemptErrors, Error, Result};
pub use lock::{Lock, EXPIRES_AT_KEY, MAX_REFRESH_FAILURES, OWNER_KEY};
pub use observability::{init_logging, LogFormat};
pub use store::{MemoryStore, ObjectAttrs, ObjectStore};
