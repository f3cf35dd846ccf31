use std::sync::Arc;

use tracing::debug;

use crate::analysis::TraceEntries;
use crate::log::{InMemoryTraceLog, TraceLog, TraceLogError};
use crate::trace::{LogPosition, TraceEntryType, TracePayload, WorkerId};

/// Handle on the shared trace log of one test run.
///
/// Construct one per run and hand clones of the `Arc` to whatever traces or
/// analyses; there is no process-wide instance.
#[derive(Clone)]
pub struct RaceTracker {
    log: Arc<dyn TraceLog>,
}

impl RaceTracker {
    pub fn new(log: Arc<dyn TraceLog>) -> Self {
        Self { log }
    }

    /// Tracker for workers that are threads of this process.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTraceLog::new()))
    }

    /// Tracker on the configured Redis stream, shared across processes.
    #[cfg(feature = "redis")]
    pub fn connect(config: &crate::config::RaceTrackerConfig) -> Result<Self, TraceLogError> {
        Ok(Self::new(Arc::new(crate::redis_log::RedisTraceLog::connect(config)?)))
    }

    /// Append an entry on behalf of the calling thread.
    pub fn trace(&self, entry_type: TraceEntryType, payload: TracePayload) -> Result<LogPosition, TraceLogError> {
        self.trace_as(&WorkerId::current(), entry_type, payload)
    }

    pub fn trace_as(
        &self,
        worker: &WorkerId,
        entry_type: TraceEntryType,
        payload: TracePayload,
    ) -> Result<LogPosition, TraceLogError> {
        self.log.append(worker, entry_type, &payload)
    }

    /// Everything traced since the last reset, in log order.
    pub fn traces(&self) -> Result<TraceEntries, TraceLogError> {
        self.log.entries().map(TraceEntries::new)
    }

    /// Clear the log. Resetting an empty log is a no-op.
    pub fn reset(&self) -> Result<(), TraceLogError> {
        debug!("resetting race tracker log");
        self.log.clear()
    }
}

impl core::fmt::Debug for RaceTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RaceTracker").finish_non_exhaustive()
    }
}
