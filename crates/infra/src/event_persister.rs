//! Committing events and kicking off projection catch-up.
//!
//! ## Publish Flow
//!
//! ```text
//! EventsToPublish
//!   ↓
//! 1. Commit to the event store (optimistic concurrency on the stream)
//!   ↓
//! 2. Compute pending projections from the committed batch
//!   ↓
//! 3. Trigger catch-up for the pending projections only
//!   ↓
//! CommandResult (caller may `block()` for read-your-writes)
//! ```
//!
//! A failing trigger does not undo the commit: the events are durable, so the
//! error is logged and the next trigger (or `block()` timing out) surfaces
//! the lag.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use escr_events::{PendingProjections, PendingProjectionsError};

use crate::command_result::{BlockPolicy, CommandResult};
use crate::content_repository::ContentRepository;
use crate::event_store::{EventStore, EventStoreError, EventsToPublish};
use crate::trigger::ProjectionCatchUpTrigger;

#[derive(Debug, Error)]
pub enum PersistError {
    /// Optimistic concurrency failure (stale expected version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error(transparent)]
    Store(EventStoreError),

    #[error(transparent)]
    PendingProjections(#[from] PendingProjectionsError),
}

impl From<EventStoreError> for PersistError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => PersistError::Concurrency(msg),
            other => PersistError::Store(other),
        }
    }
}

/// Commits events of one content repository and triggers catch-up.
pub struct EventPersister {
    repository: Arc<ContentRepository>,
    trigger: Arc<dyn ProjectionCatchUpTrigger>,
    policy: BlockPolicy,
}

impl EventPersister {
    pub fn new(repository: Arc<ContentRepository>, trigger: Arc<dyn ProjectionCatchUpTrigger>) -> Self {
        Self {
            repository,
            trigger,
            policy: BlockPolicy::default(),
        }
    }

    pub fn with_block_policy(mut self, policy: BlockPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn repository(&self) -> &Arc<ContentRepository> {
        &self.repository
    }

    /// Commit `events` and trigger catch-up of the projections they concern.
    ///
    /// An empty batch commits nothing and yields a result with nothing to
    /// wait for.
    #[instrument(
        skip(self, events),
        fields(
            repository = %self.repository.id(),
            stream_name = %events.stream_name,
            event_count = events.events.len()
        ),
        err
    )]
    pub fn publish_events(&self, events: EventsToPublish) -> Result<CommandResult, PersistError> {
        if events.is_empty() {
            return Ok(CommandResult::nothing_to_wait_for());
        }

        let commit = self.repository.event_store().commit(
            &events.stream_name,
            &events.events,
            events.expected_version,
        )?;

        let pending = PendingProjections::calculate(
            self.repository.projections(),
            &events.events,
            commit.highest_committed_sequence_number,
        )?;
        debug!(
            highest = %commit.highest_committed_sequence_number,
            pending = pending.len(),
            "events committed"
        );

        if !pending.is_empty() {
            if let Err(err) = self.trigger.trigger_catch_up(&pending.projection_ids()) {
                warn!(error = %err, "catch-up trigger failed after commit");
            }
        }

        Ok(CommandResult::new(
            commit,
            pending,
            self.repository.checkpoints().clone(),
            self.policy,
        ))
    }
}

impl core::fmt::Debug for EventPersister {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPersister")
            .field("repository", self.repository.id())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
