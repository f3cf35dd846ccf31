use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use escr_core::{ExpectedVersion, SequenceNumber, StreamName};
use escr_events::{Event, EventEnvelope};

/// A batch of events to be committed to one stream.
///
/// `EventsToPublish` is what command handlers produce: the target stream, the
/// events in order, and the version the handler based its decision on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsToPublish {
    pub stream_name: StreamName,
    pub events: Vec<Event>,
    pub expected_version: ExpectedVersion,
}

impl EventsToPublish {
    pub fn new(stream_name: StreamName, events: Vec<Event>, expected_version: ExpectedVersion) -> Self {
        Self {
            stream_name,
            events,
            expected_version,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Outcome of a successful commit.
///
/// `highest_committed_sequence_number` is the global position of the **last**
/// event of the batch. Because batches are contiguous, the batch occupies
/// `highest - len + 1 ..= highest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub highest_committed_version: u64,
    pub highest_committed_sequence_number: SequenceNumber,
}

/// Which part of the global log to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogRange {
    after: SequenceNumber,
    up_to: Option<SequenceNumber>,
    limit: Option<usize>,
}

impl LogRange {
    /// Everything strictly after `after`.
    pub fn after(after: SequenceNumber) -> Self {
        Self {
            after,
            up_to: None,
            limit: None,
        }
    }

    /// Stop at `up_to` (inclusive).
    pub fn up_to(mut self, up_to: Option<SequenceNumber>) -> Self {
        self.up_to = up_to;
        self
    }

    /// Load at most `limit` events.
    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn start_after(&self) -> SequenceNumber {
        self.after
    }

    pub fn upper_bound(&self) -> Option<SequenceNumber> {
        self.up_to
    }

    pub fn max_events(&self) -> Option<usize> {
        self.limit
    }

    pub fn contains(&self, seq: SequenceNumber) -> bool {
        seq > self.after && self.up_to.is_none_or(|up_to| seq <= up_to)
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// projection errors.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event store storage failed: {0}")]
    Storage(String),
}

/// Append-only store holding per-stream histories and the global event log.
///
/// ## Commit Semantics
///
/// `commit()`:
/// - checks `expected_version` against the stream's current version
/// - assigns each event the next global sequence number; the sequence is
///   gap-free and a batch always occupies a contiguous range
/// - persists all events or none
///
/// Commits are serialized: two concurrent commits never interleave their
/// sequence numbers.
///
/// ## Load Semantics
///
/// `load_all()` returns envelopes of the global log in ascending sequence
/// number order. Catch-up reads through this method only.
pub trait EventStore: Send + Sync {
    /// Create tables etc. Idempotent.
    fn setup(&self) -> Result<(), EventStoreError> {
        Ok(())
    }

    fn commit(
        &self,
        stream_name: &StreamName,
        events: &[Event],
        expected_version: ExpectedVersion,
    ) -> Result<CommitResult, EventStoreError>;

    /// Load a single stream in version order. Unknown streams are empty.
    fn load_stream(&self, stream_name: &StreamName) -> Result<Vec<EventEnvelope>, EventStoreError>;

    fn load_all(&self, range: LogRange) -> Result<Vec<EventEnvelope>, EventStoreError>;

    /// Sequence number of the last committed event (`none` for an empty log).
    fn highest_sequence_number(&self) -> Result<SequenceNumber, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn setup(&self) -> Result<(), EventStoreError> {
        (**self).setup()
    }

    fn commit(
        &self,
        stream_name: &StreamName,
        events: &[Event],
        expected_version: ExpectedVersion,
    ) -> Result<CommitResult, EventStoreError> {
        (**self).commit(stream_name, events, expected_version)
    }

    fn load_stream(&self, stream_name: &StreamName) -> Result<Vec<EventEnvelope>, EventStoreError> {
        (**self).load_stream(stream_name)
    }

    fn load_all(&self, range: LogRange) -> Result<Vec<EventEnvelope>, EventStoreError> {
        (**self).load_all(range)
    }

    fn highest_sequence_number(&self) -> Result<SequenceNumber, EventStoreError> {
        (**self).highest_sequence_number()
    }
}
