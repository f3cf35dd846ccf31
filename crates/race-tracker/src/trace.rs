//! Trace entries written by catch-up workers.
//!
//! ## Wire format
//!
//! Each entry is a flat map, so it fits a Redis stream entry as-is:
//!
//! | field        | present on             | meaning                         |
//! |--------------|------------------------|---------------------------------|
//! | `pid`        | all                    | worker (process + thread)       |
//! | `type`       | all                    | `InCriticalSection` / `LockWillBeReleased` |
//! | `projection` | all                    | projection being caught up      |
//! | `evt`        | `InCriticalSection`    | event type                      |
//! | `seq`        | `InCriticalSection`    | global sequence number          |
//! | `id`         | `InCriticalSection`    | event id                        |

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use escr_core::{EventId, ProjectionId, SequenceNumber};
use escr_events::EventEnvelope;

use crate::log::TraceLogError;

/// Identifies one catch-up worker: `<process id>/<thread id>`.
///
/// Threads of one process are distinct workers; in-process triggers run
/// catch-ups on threads and they race just like subprocesses do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The calling thread.
    pub fn current() -> Self {
        static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);
        thread_local! {
            static THREAD: u64 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
        }

        let thread = THREAD.with(|thread| *thread);
        Self(format!("{}/{}", std::process::id(), thread))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position assigned by the trace log on append (a Redis stream id, or an
/// index for the in-memory log). Only used for reporting; order is the
/// order in which [`crate::TraceLog::entries`] returns entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogPosition(String);

impl LogPosition {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceEntryType {
    /// A worker is about to apply an event while holding the projection lock.
    InCriticalSection,
    /// A worker is about to release the projection lock.
    LockWillBeReleased,
}

impl TraceEntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceEntryType::InCriticalSection => "InCriticalSection",
            TraceEntryType::LockWillBeReleased => "LockWillBeReleased",
        }
    }
}

impl core::fmt::Display for TraceEntryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceEntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InCriticalSection" => Ok(TraceEntryType::InCriticalSection),
            "LockWillBeReleased" => Ok(TraceEntryType::LockWillBeReleased),
            other => Err(format!("unknown trace entry type '{other}'")),
        }
    }
}

/// Free-form part of a trace entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracePayload {
    pub projection: ProjectionId,
    #[serde(rename = "evt", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(rename = "seq", default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<SequenceNumber>,
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
}

impl TracePayload {
    /// Payload for the event about to be applied.
    pub fn event(projection: &ProjectionId, envelope: &EventEnvelope) -> Self {
        Self {
            projection: projection.clone(),
            event_type: Some(envelope.event().event_type().to_string()),
            sequence_number: Some(envelope.sequence_number()),
            event_id: Some(envelope.event().id()),
        }
    }

    /// Payload without event fields.
    pub fn projection(projection: &ProjectionId) -> Self {
        Self {
            projection: projection.clone(),
            event_type: None,
            sequence_number: None,
            event_id: None,
        }
    }

    /// The `(event id, sequence number)` pair, when both are present.
    pub fn processed_event(&self) -> Option<(EventId, SequenceNumber)> {
        Some((self.event_id?, self.sequence_number?))
    }
}

/// One entry of the shared trace log, in log order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub position: LogPosition,
    #[serde(rename = "pid")]
    pub worker: WorkerId,
    #[serde(rename = "type")]
    pub entry_type: TraceEntryType,
    #[serde(flatten)]
    pub payload: TracePayload,
}

impl TraceEntry {
    pub fn new(position: LogPosition, worker: WorkerId, entry_type: TraceEntryType, payload: TracePayload) -> Self {
        Self {
            position,
            worker,
            entry_type,
            payload,
        }
    }

    pub fn projection(&self) -> &ProjectionId {
        &self.payload.projection
    }

    /// Flat field list written to the log (everything but the position).
    pub fn fields(worker: &WorkerId, entry_type: TraceEntryType, payload: &TracePayload) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("pid", worker.to_string()),
            ("type", entry_type.to_string()),
            ("projection", payload.projection.to_string()),
        ];
        if let Some(evt) = &payload.event_type {
            fields.push(("evt", evt.clone()));
        }
        if let Some(seq) = payload.sequence_number {
            fields.push(("seq", seq.value().to_string()));
        }
        if let Some(id) = payload.event_id {
            fields.push(("id", id.to_string()));
        }
        fields
    }

    /// Parse an entry read back from the log.
    pub fn from_fields(position: LogPosition, fields: &HashMap<String, String>) -> Result<Self, TraceLogError> {
        let malformed = |message: String| TraceLogError::Malformed {
            position: position.clone(),
            message,
        };
        let field = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| malformed(format!("missing field '{name}'")))
        };

        let worker = WorkerId::new(field("pid")?.clone());
        let entry_type = field("type")?.parse::<TraceEntryType>().map_err(malformed)?;
        let projection = ProjectionId::new(field("projection")?.clone()).map_err(|e| malformed(e.to_string()))?;
        let sequence_number = fields
            .get("seq")
            .map(|s| s.parse::<u64>().map(SequenceNumber::new))
            .transpose()
            .map_err(|e| malformed(format!("invalid seq: {e}")))?;
        let event_id = fields
            .get("id")
            .map(|s| s.parse::<EventId>())
            .transpose()
            .map_err(|e| malformed(format!("invalid id: {e}")))?;

        Ok(Self {
            worker,
            entry_type,
            payload: TracePayload {
                projection,
                event_type: fields.get("evt").cloned(),
                sequence_number,
                event_id,
            },
            position,
        })
    }
}
