use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use escr_core::{SequenceNumber, StreamName};

use crate::Event;

/// Envelope for a committed event, containing stream and log metadata.
///
/// This is the unit handed to projections and catch-up hooks.
///
/// Notes:
/// - `version` is the position inside `stream_name` (1-based, per stream).
/// - `sequence_number` is the position in the global log (1-based, gap-free).
/// - Envelopes are created by the event store on commit and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event: Event,
    stream_name: StreamName,
    version: u64,
    sequence_number: SequenceNumber,
    recorded_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(
        event: Event,
        stream_name: StreamName,
        version: u64,
        sequence_number: SequenceNumber,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event,
            stream_name,
            version,
            sequence_number,
            recorded_at,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn stream_name(&self) -> &StreamName {
        &self.stream_name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}
