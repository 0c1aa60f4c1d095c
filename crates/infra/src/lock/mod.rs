//! Distributed lock backed by rows in the shared store.
//!
//! ## Design
//!
//! - One row per locked resource in the `lock` table; the unique constraint on
//!   `resource` is what makes the claim exclusive across processes.
//! - Acquisition polls: an attempt either claims the row or fails, and a failed
//!   attempt sleeps `min(1s, remaining timeout)` before retrying. Faults raised
//!   during an attempt count as failed attempts and are never surfaced.
//! - Release deletes the row. Only the first call does anything; a release
//!   that finds no row reports that the lock was lost.
//!
//! ## Lifecycle
//!
//! ```text
//! acquire ─┬─ attempt ok ──────────────► Acquired ─ release ─┬─► Released
//!          ├─ attempt failed ─ sleep ─► (retry)              └─► ReleaseFailed
//!          └─ timeout elapsed ─────────► LockError::Timeout
//! ```

pub mod policy;

pub use policy::LockPolicy;

use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, instrument, warn};

use jobstore_core::ensure_not_blank;

use crate::store::{Mutation, StoreError, StoreSession};

/// Longest pause between two acquisition attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Distributed lock failure.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// The lock could not be acquired before the timeout elapsed.
    #[error("Could not place a lock on the resource '{resource}': Lock timeout.")]
    Timeout { resource: String },

    /// Release found no row: the lock was lost, expired out of band, or released elsewhere.
    #[error("Could not release a lock on the resource '{resource}'. Lock does not exist.")]
    Release { resource: String },

    /// The release statement itself failed.
    #[error("Could not release a lock on the resource '{resource}': {source}")]
    Store {
        resource: String,
        #[source]
        source: StoreError,
    },

    /// The resource name was rejected before any attempt.
    #[error("invalid lock resource '{resource}': {reason}")]
    InvalidResource { resource: String, reason: String },
}

impl LockError {
    /// Resource the failure refers to.
    pub fn resource(&self) -> &str {
        match self {
            LockError::Timeout { resource }
            | LockError::Release { resource }
            | LockError::Store { resource, .. }
            | LockError::InvalidResource { resource, .. } => resource,
        }
    }
}

/// State of an acquired lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Acquired,
    Released,
    ReleaseFailed,
}

/// An acquired distributed lock.
///
/// Call [`release`](Self::release) when done. Dropping an unreleased lock
/// leaves its row behind (async release cannot run in `Drop`) and logs a
/// warning.
pub struct DistributedLock<S: StoreSession> {
    resource: String,
    session: S,
    state: LockState,
}

impl<S: StoreSession> std::fmt::Debug for DistributedLock<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("resource", &self.resource)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<S: StoreSession> DistributedLock<S> {
    /// Acquire `resource`, polling until `timeout` elapses.
    #[instrument(skip(session, resource), fields(resource = tracing::field::Empty), err)]
    pub async fn acquire(
        session: S,
        resource: impl Into<String>,
        timeout: Duration,
        policy: LockPolicy,
    ) -> Result<Self, LockError> {
        let resource = resource.into();
        tracing::Span::current().record("resource", resource.as_str());
        if let Err(e) = ensure_not_blank("resource", &resource) {
            return Err(LockError::InvalidResource {
                resource,
                reason: e.to_string(),
            });
        }

        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match policy.attempt(&session, &resource).await {
                Ok(true) => {
                    debug!(attempts, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                    return Ok(Self {
                        resource,
                        session,
                        state: LockState::Acquired,
                    });
                }
                Ok(false) => {}
                Err(fault) => debug!(attempts, error = %fault, "lock attempt failed"),
            }

            let elapsed = started.elapsed();
            if elapsed > timeout {
                break;
            }
            let pause = timeout.saturating_sub(elapsed).min(MAX_RETRY_DELAY);
            if pause.is_zero() {
                break;
            }
            sleep(pause).await;
        }

        warn!(attempts, timeout_ms = timeout.as_millis() as u64, "lock timeout");
        Err(LockError::Timeout { resource })
    }

    /// Release the lock by deleting its row.
    ///
    /// Only the first call has an effect; later calls return `Ok(())`.
    #[instrument(skip(self), fields(resource = %self.resource))]
    pub async fn release(&mut self) -> Result<(), LockError> {
        if self.state != LockState::Acquired {
            return Ok(());
        }
        self.state = LockState::ReleaseFailed;

        let deleted = self
            .session
            .execute(&Mutation::DeleteLock {
                resource: self.resource.clone(),
            })
            .await
            .map_err(|source| LockError::Store {
                resource: self.resource.clone(),
                source,
            })?;

        if deleted == 0 {
            warn!("lock row already gone on release");
            return Err(LockError::Release {
                resource: self.resource.clone(),
            });
        }

        self.state = LockState::Released;
        debug!("lock released");
        Ok(())
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_released(&self) -> bool {
        self.state != LockState::Acquired
    }

    /// The session the lock was acquired through.
    pub fn session(&self) -> &S {
        &self.session
    }
}

impl<S: StoreSession> Drop for DistributedLock<S> {
    fn drop(&mut self) {
        if self.state == LockState::Acquired {
            warn!(resource = %self.resource, "distributed lock dropped without release");
        }
    }
}
