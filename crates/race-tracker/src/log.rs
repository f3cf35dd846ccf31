//! The shared, totally ordered trace log.

use std::sync::Mutex;

use thiserror::Error;

use crate::trace::{LogPosition, TraceEntry, TraceEntryType, TracePayload, WorkerId};

#[derive(Debug, Error)]
pub enum TraceLogError {
    #[error("trace log connection error: {0}")]
    Connection(String),

    #[error("trace log command error: {0}")]
    Command(String),

    #[error("malformed trace entry at {position}: {message}")]
    Malformed { position: LogPosition, message: String },
}

/// Append-only log shared by every worker of a test run.
///
/// Appends from all writers must end up in one total order, and
/// [`TraceLog::entries`] returns them in that order.
pub trait TraceLog: Send + Sync {
    fn append(
        &self,
        worker: &WorkerId,
        entry_type: TraceEntryType,
        payload: &TracePayload,
    ) -> Result<LogPosition, TraceLogError>;

    fn entries(&self) -> Result<Vec<TraceEntry>, TraceLogError>;

    /// Remove every entry. Clearing an empty log is a no-op.
    fn clear(&self) -> Result<(), TraceLogError>;
}

/// Trace log for workers that share one process (threads).
#[derive(Debug, Default)]
pub struct InMemoryTraceLog {
    entries: Mutex<Vec<TraceEntry>>,
}

impl InMemoryTraceLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TraceLog for InMemoryTraceLog {
    fn append(
        &self,
        worker: &WorkerId,
        entry_type: TraceEntryType,
        payload: &TracePayload,
    ) -> Result<LogPosition, TraceLogError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| TraceLogError::Command("trace log poisoned".to_string()))?;
        let position = LogPosition::new(entries.len().to_string());
        entries.push(TraceEntry::new(position.clone(), worker.clone(), entry_type, payload.clone()));
        Ok(position)
    }

    fn entries(&self) -> Result<Vec<TraceEntry>, TraceLogError> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .map_err(|_| TraceLogError::Command("trace log poisoned".to_string()))
    }

    fn clear(&self) -> Result<(), TraceLogError> {
        self.entries
            .lock()
            .map(|mut entries| entries.clear())
            .map_err(|_| TraceLogError::Command("trace log poisoned".to_string()))
    }
}
