//! Distributed mutual-exclusion lock on a consistent object store.
//!
//! A lock is named by an object path. The protocol needs no channel
//! between contenders; it leans entirely on the store's conditional
//! primitives:
//!
//! 1. Acquisition creates a zero-byte object conditioned on it not
//!    existing, with the holder identity and lease expiry inscribed in
//!    user metadata. Only one creator can win.
//! 2. If the object already exists, the contender probes it: a lock left
//!    behind by a prior incarnation of itself, or one whose lease has
//!    elapsed, is deleted conditioned on the observed `metageneration`.
//!    Competing reapers are serialized by that condition; at most one
//!    wins.
//! 3. The holder periodically refreshes the lease with a metadata update
//!    conditioned on both counters it last wrote. Any counter movement
//!    means the lock was reaped or replaced, and the holder must stop.
//! 4. Release deletes the object conditioned on `metageneration`, after
//!    confirming the inscribed owner is still us.
//!
//! Counter conditions are the sole source of cross-process ordering. The
//! wall clock is consulted only for liveness (reaping an expired lease),
//! never for mutual exclusion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use ulid::Ulid;

use crate::error::{AttemptErrors, Error, Result};
use crate::store::ObjectStore;

/// Consecutive transient refresh failures tolerated while holding. The
/// refresh after the budget is spent reports the lock as abandoned
/// without contacting the store.
pub const MAX_REFRESH_FAILURES: u32 = 3;

/// User-metadata key carrying the holder identity.
pub const OWNER_KEY: &str = "owner";

/// User-metadata key carrying the lease expiry, RFC-3339 with nanosecond
/// precision, UTC.
pub const EXPIRES_AT_KEY: &str = "expires-at";

/// Fixed pause between acquisition attempts.
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(100);

/// Cache-control written on the lock object so no interposed cache can
/// serve a stale read of it.
const CACHE_CONTROL: &str = "no-store";

#[derive(Debug, Default)]
struct LockState {
    /// Whether we believe we currently own the lock.
    holding: bool,
    /// Content generation we last wrote via create or update.
    generation: i64,
    /// Metadata generation we last wrote via create or update.
    metageneration: i64,
    /// Consecutive transient refresh failures.
    refresh_failures: u32,
}

/// A mutual-exclusion lock named by an object path.
///
/// An instance is bound to a store, a path, a holder identity, and a
/// lease TTL. It starts idle; [`acquire`](Lock::acquire) makes it the
/// holder, [`refresh`](Lock::refresh) extends the lease, and
/// [`release`](Lock::release) gives the lock up. An instance may be
/// reused across acquire/release cycles.
///
/// All three operations serialize on one internal mutex, held across the
/// store round-trips: the cached counters are read-modify-written against
/// the store, and the simplest correct design keeps them consistent by
/// not interleaving operations within an instance. Callers needing
/// concurrency use separate instances.
pub struct Lock<S: ObjectStore + ?Sized> {
    store: Arc<S>,
    path: String,
    identity: String,
    ttl: Duration,
    state: Mutex<LockState>,
}

impl<S: ObjectStore + ?Sized> Lock<S> {
    /// Creates an idle lock client for `path` with the given holder
    /// identity and lease TTL.
    ///
    /// The identity must be unique among contenders on the same path; a
    /// holder that finds its own identity on an existing lock treats it
    /// as an orphan from a prior incarnation and reclaims it.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        identity: impl Into<String>,
        path: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            path: path.into(),
            identity: identity.into(),
            ttl,
            state: Mutex::new(LockState::default()),
        }
    }

    /// Creates an idle lock client with a generated unique identity.
    #[must_use]
    pub fn with_generated_identity(store: Arc<S>, path: impl Into<String>, ttl: Duration) -> Self {
        Self::new(store, Ulid::new().to_string(), path, ttl)
    }

    /// Returns the holder identity of this instance.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the lock object path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns whether this instance believes it holds the lock. This is
    /// local state only; the belief is validated against the store by the
    /// next [`refresh`](Lock::refresh).
    pub async fn is_held(&self) -> bool {
        self.state.lock().await.holding
    }

    /// Attempts to become the holder, retrying until `timeout` elapses.
    ///
    /// The caller is expected to call [`refresh`](Lock::refresh) on a
    /// cadence comfortably shorter than the TTL while holding, and
    /// [`release`](Lock::release) when done.
    ///
    /// A zero timeout fails immediately without contacting the store.
    /// Dropping the returned future cancels the in-flight attempt; the
    /// lock may or may not have been created on the store at that point,
    /// which the next acquire by this identity resolves via the orphan
    /// probe.
    ///
    /// # Errors
    ///
    /// [`Error::DeadlineExceeded`] carrying every attempt failure once the
    /// timeout elapses, or the error that aborted a stale-lock probe.
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let deadline = Instant::now() + timeout;
        let mut attempts = Vec::new();

        loop {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded {
                    path: self.path.clone(),
                    timeout,
                    attempts: AttemptErrors::from(attempts),
                });
            }

            match self.create_lock(&mut state).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if matches!(err, Error::PreconditionFailed { .. }) {
                        self.reap_if_stale(&mut state).await?;
                    }
                    tracing::error!(path = %self.path, error = %err, "failed to acquire lock");
                    attempts.push(err);
                }
            }

            tokio::time::sleep(ACQUIRE_BACKOFF).await;
        }
    }

    /// Extends the lease on a held lock.
    ///
    /// A no-op returning `Ok` when not holding, so it can be scheduled
    /// unconditionally from a ticker even across acquire retries.
    ///
    /// # Errors
    ///
    /// [`Error::Abandoned`] the first time it is certain the lock is no
    /// longer ours (the object vanished, a counter moved, or the
    /// transient-failure budget is spent); the instance is idle
    /// afterwards. Other store failures are returned verbatim and count
    /// against the budget of [`MAX_REFRESH_FAILURES`].
    pub async fn refresh(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        if !state.holding {
            return Ok(());
        }

        if state.refresh_failures >= MAX_REFRESH_FAILURES {
            state.holding = false;
            state.refresh_failures = 0;
            return Err(Error::Abandoned);
        }

        tracing::info!(path = %self.path, "refreshing lock");

        match self
            .store
            .update_metadata(
                &self.path,
                self.lease_metadata(),
                state.generation,
                state.metageneration,
            )
            .await
        {
            Ok(attrs) => {
                state.refresh_failures = 0;
                state.generation = attrs.generation;
                state.metageneration = attrs.metageneration;
                Ok(())
            }
            Err(Error::NotFound(_) | Error::PreconditionFailed { .. }) => {
                state.holding = false;
                state.refresh_failures = 0;
                Err(Error::Abandoned)
            }
            Err(err) => {
                state.refresh_failures += 1;
                Err(err)
            }
        }
    }

    /// Deletes the lock object if we still own it.
    ///
    /// Lenient by contract, so callers can schedule it as an
    /// unconditional finalizer: an already-gone object and a moved
    /// `metageneration` both return `Ok`. Dropping the returned future
    /// does not free the lock; the owner remains responsible.
    ///
    /// # Errors
    ///
    /// [`Error::OwnedByOther`] if the store names a different owner;
    /// other store failures verbatim, leaving the held state unchanged so
    /// refresh keeps maintaining the lease until release is retried.
    pub async fn release(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.delete_lock(&mut state, None, true).await
    }

    /// One create attempt. On success the freshly assigned counters are
    /// learned with a separate read, because the create primitive does
    /// not echo them.
    async fn create_lock(&self, state: &mut LockState) -> Result<()> {
        self.store
            .create_object(&self.path, self.lease_metadata(), CACHE_CONTROL)
            .await?;

        let attrs = self.store.read_attributes(&self.path).await?;

        state.holding = true;
        state.refresh_failures = 0;
        state.generation = attrs.generation;
        state.metageneration = attrs.metageneration;
        Ok(())
    }

    /// Probes an existing lock after a lost create race and reaps it when
    /// it is an orphan of ours or its lease has elapsed.
    ///
    /// Both reaps delete conditioned on the just-read `metageneration`,
    /// which serializes competing reapers: at most one wins, the rest see
    /// a precondition failure (swallowed) and go back to creating.
    async fn reap_if_stale(&self, state: &mut LockState) -> Result<()> {
        let attrs = self.store.read_attributes(&self.path).await?;

        if attrs.metadata.get(OWNER_KEY) == Some(&self.identity) {
            // A prior incarnation of ourselves did not release cleanly.
            self.delete_lock(state, Some(attrs.metageneration), false)
                .await?;
        }

        let raw_expiry = attrs
            .metadata
            .get(EXPIRES_AT_KEY)
            .map(String::as_str)
            .unwrap_or_default();

        match DateTime::parse_from_rfc3339(raw_expiry) {
            Ok(expires_at) if Utc::now() > expires_at.with_timezone(&Utc) => {
                tracing::info!(path = %self.path, "lock expired");
                self.delete_lock(state, Some(attrs.metageneration), false)
                    .await
            }
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::info!(path = %self.path, error = %err, "lock expired");
                self.delete_lock(state, Some(attrs.metageneration), false)
                    .await
            }
        }
    }

    /// Deletes the lock object conditioned on `metageneration` (the
    /// cached value unless the reap callsite supplies the one it just
    /// read). Not-found and precondition-failed both mean the object is
    /// no longer ours to delete and are swallowed.
    async fn delete_lock(
        &self,
        state: &mut LockState,
        metageneration: Option<i64>,
        confirm_owner: bool,
    ) -> Result<()> {
        if confirm_owner {
            // The lock could have been reaped and re-created at a
            // metageneration that happens to match our cached one, so the
            // counter condition alone is not enough here.
            let attrs = match self.store.read_attributes(&self.path).await {
                Ok(attrs) => attrs,
                Err(Error::NotFound(_)) => {
                    state.holding = false;
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            if attrs.metadata.get(OWNER_KEY) != Some(&self.identity) {
                return Err(Error::OwnedByOther);
            }
        }

        let metageneration = metageneration.unwrap_or(state.metageneration);

        match self.store.delete_object(&self.path, metageneration).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(Error::PreconditionFailed { .. }) => {
                tracing::info!(path = %self.path, "lock already claimed by another party");
            }
            Err(err) => return Err(err),
        }

        state.holding = false;
        Ok(())
    }

    fn lease_metadata(&self) -> HashMap<String, String> {
        let ttl =
            chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let expires_at = (Utc::now() + ttl).to_rfc3339_opts(SecondsFormat::Nanos, true);

        HashMap::from([
            (OWNER_KEY.to_string(), self.identity.clone()),
            (EXPIRES_AT_KEY.to_string(), expires_at),
        ])
    }
}
