//! Result of a command, with the ability to wait for its read models.
//!
//! Projections are updated asynchronously after a commit. A caller that wants
//! to read its own writes calls [`CommandResult::block`], which waits until
//! every **pending** projection has applied the last committed event it
//! handles. Projections that ignore all committed events are not waited for.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use escr_core::{ProjectionId, SequenceNumber};
use escr_events::PendingProjections;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::event_store::CommitResult;

/// How long [`CommandResult::block`] polls a projection's checkpoint.
///
/// The defaults wait about 5 seconds per projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_attempts: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum BlockError {
    #[error(
        "projection '{projection}' did not reach sequence number {expected} after {attempts} attempts (at {observed})"
    )]
    ProjectionCatchUpTimeout {
        projection: ProjectionId,
        expected: SequenceNumber,
        observed: SequenceNumber,
        attempts: u32,
    },

    #[error("projection '{0}' is not pending for this command")]
    NotPending(ProjectionId),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// What a command committed and which projections still have to catch up.
pub struct CommandResult {
    commit: Option<CommitResult>,
    pending: PendingProjections,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    policy: BlockPolicy,
}

impl CommandResult {
    pub fn new(
        commit: CommitResult,
        pending: PendingProjections,
        checkpoints: Arc<dyn CheckpointStore>,
        policy: BlockPolicy,
    ) -> Self {
        Self {
            commit: Some(commit),
            pending,
            checkpoints: Some(checkpoints),
            policy,
        }
    }

    /// A command that committed nothing; `block` returns immediately.
    pub fn nothing_to_wait_for() -> Self {
        Self {
            commit: None,
            pending: PendingProjections::empty(),
            checkpoints: None,
            policy: BlockPolicy::default(),
        }
    }

    pub fn commit(&self) -> Option<&CommitResult> {
        self.commit.as_ref()
    }

    pub fn pending_projections(&self) -> &PendingProjections {
        &self.pending
    }

    /// Wait until every pending projection has caught up with this command.
    ///
    /// Projections are awaited one after another, each with its own attempt
    /// budget. The first projection that does not get there fails the call.
    pub fn block(&self) -> Result<(), BlockError> {
        for (projection, expected) in self.pending.iter() {
            self.wait_for(projection, expected)?;
        }
        Ok(())
    }

    /// Wait for a single pending projection.
    pub fn block_for(&self, projection: &ProjectionId) -> Result<(), BlockError> {
        let expected = self.expected_sequence_number(projection)?;
        self.wait_for(projection, expected)
    }

    /// The sequence number `projection` has to reach for this command.
    ///
    /// Fails with [`BlockError::NotPending`] for a projection this command
    /// never concerned.
    pub fn expected_sequence_number(&self, projection: &ProjectionId) -> Result<SequenceNumber, BlockError> {
        self.pending
            .get(projection)
            .ok_or_else(|| BlockError::NotPending(projection.clone()))
    }

    fn wait_for(&self, projection: &ProjectionId, expected: SequenceNumber) -> Result<(), BlockError> {
        let Some(checkpoints) = &self.checkpoints else {
            return Ok(());
        };

        // The initial read is not an attempt.
        let mut observed = checkpoints.highest_applied_sequence_number(projection)?;
        let mut attempts = 0;
        while observed < expected && attempts < self.policy.max_attempts {
            thread::sleep(self.policy.poll_interval);
            observed = checkpoints.highest_applied_sequence_number(projection)?;
            attempts += 1;
        }
        if observed >= expected {
            debug!(projection = %projection, expected = %expected, attempts, "projection caught up");
            return Ok(());
        }

        warn!(projection = %projection, expected = %expected, observed = %observed, "timed out waiting for projection");
        Err(BlockError::ProjectionCatchUpTimeout {
            projection: projection.clone(),
            expected,
            observed,
            attempts: self.policy.max_attempts,
        })
    }
}

impl core::fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandResult")
            .field("commit", &self.commit)
            .field("pending", &self.pending)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
