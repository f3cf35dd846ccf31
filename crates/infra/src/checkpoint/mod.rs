//! Per-projection checkpoints guarded by an exclusive lock.
//!
//! A checkpoint is the highest sequence number a projection has applied. It
//! only moves while the projection's lock is held:
//!
//! ```text
//! acquire_lock ──> (apply events) ──> update_and_release_lock
//!        │                                  ▲
//!        └──────── release_lock ────────────┘   (nothing applied)
//! ```
//!
//! At most one holder per projection exists at any time, across threads and
//! processes (for the Postgres store). The lock is what keeps a projection
//! from running concurrently with itself; the race tracker verifies exactly
//! this property.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use escr_core::{ProjectionId, SequenceNumber};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;

/// Default time `acquire_lock` waits for a competing holder.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("projection '{0}' is locked by another catch-up")]
    AlreadyLocked(ProjectionId),

    #[error("timed out after {waited:?} waiting for the lock of projection '{projection}'")]
    LockTimeout {
        projection: ProjectionId,
        waited: Duration,
    },

    #[error("projection '{0}' is not locked by this store")]
    NotLocked(ProjectionId),

    #[error(
        "checkpoint of projection '{projection}' cannot move backwards from {current} to {attempted}"
    )]
    NonMonotonic {
        projection: ProjectionId,
        current: SequenceNumber,
        attempted: SequenceNumber,
    },

    #[error("checkpoint storage failed: {0}")]
    Storage(String),
}

/// Persistent per-projection progress plus an exclusive lock.
pub trait CheckpointStore: Send + Sync {
    /// Ensure storage exists and `projection` has a checkpoint row. Idempotent.
    fn setup(&self, projection: &ProjectionId) -> Result<(), CheckpointError>;

    /// Current checkpoint; readable without holding the lock.
    fn highest_applied_sequence_number(
        &self,
        projection: &ProjectionId,
    ) -> Result<SequenceNumber, CheckpointError>;

    /// Take the lock if it is free, returning the checkpoint at that moment.
    ///
    /// Fails with [`CheckpointError::AlreadyLocked`] instead of waiting.
    fn try_acquire_lock(&self, projection: &ProjectionId) -> Result<SequenceNumber, CheckpointError>;

    /// Take the lock, waiting up to the store's lock timeout.
    fn acquire_lock(&self, projection: &ProjectionId) -> Result<SequenceNumber, CheckpointError>;

    /// Persist `applied` and release the lock.
    ///
    /// The checkpoint never moves backwards: a lower value than the current
    /// one fails with [`CheckpointError::NonMonotonic`]. The lock is released
    /// either way.
    fn update_and_release_lock(
        &self,
        projection: &ProjectionId,
        applied: SequenceNumber,
    ) -> Result<(), CheckpointError>;

    /// Release the lock without touching the checkpoint.
    fn release_lock(&self, projection: &ProjectionId) -> Result<(), CheckpointError>;

    /// Set the checkpoint back to [`SequenceNumber::none`] and release the lock.
    ///
    /// Only valid while holding the lock; this is the single way a checkpoint
    /// may decrease.
    fn reset_and_release_lock(&self, projection: &ProjectionId) -> Result<(), CheckpointError>;
}

impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    fn setup(&self, projection: &ProjectionId) -> Result<(), CheckpointError> {
        (**self).setup(projection)
    }

    fn highest_applied_sequence_number(
        &self,
        projection: &ProjectionId,
    ) -> Result<SequenceNumber, CheckpointError> {
        (**self).highest_applied_sequence_number(projection)
    }

    fn try_acquire_lock(&self, projection: &ProjectionId) -> Result<SequenceNumber, CheckpointError> {
        (**self).try_acquire_lock(projection)
    }

    fn acquire_lock(&self, projection: &ProjectionId) -> Result<SequenceNumber, CheckpointError> {
        (**self).acquire_lock(projection)
    }

    fn update_and_release_lock(
        &self,
        projection: &ProjectionId,
        applied: SequenceNumber,
    ) -> Result<(), CheckpointError> {
        (**self).update_and_release_lock(projection, applied)
    }

    fn release_lock(&self, projection: &ProjectionId) -> Result<(), CheckpointError> {
        (**self).release_lock(projection)
    }

    fn reset_and_release_lock(&self, projection: &ProjectionId) -> Result<(), CheckpointError> {
        (**self).reset_and_release_lock(projection)
    }
}
