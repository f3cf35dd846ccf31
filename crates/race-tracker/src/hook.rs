//! Catch-up hook that writes the race tracker trace.

use std::sync::Arc;

use tracing::warn;

use escr_core::ProjectionId;
use escr_events::{CatchUpHook, CatchUpHookFactory, EventEnvelope};

use crate::trace::{TraceEntryType, TracePayload, WorkerId};
use crate::tracker::RaceTracker;

/// Traces `InCriticalSection` before every applied event and
/// `LockWillBeReleased` at the end of each batch that applied something.
///
/// Write failures are logged and otherwise ignored; a hook never affects the
/// catch-up it observes.
#[derive(Debug)]
pub struct RaceTrackerCatchUpHook {
    tracker: RaceTracker,
    projection: ProjectionId,
    worker: WorkerId,
    in_critical_section: bool,
}

impl RaceTrackerCatchUpHook {
    pub fn new(tracker: RaceTracker, projection: ProjectionId) -> Self {
        Self {
            tracker,
            projection,
            worker: WorkerId::current(),
            in_critical_section: false,
        }
    }

    fn trace(&self, entry_type: TraceEntryType, payload: TracePayload) {
        if let Err(err) = self.tracker.trace_as(&self.worker, entry_type, payload) {
            warn!(
                projection = %self.projection,
                entry_type = %entry_type,
                error = %err,
                "failed to write race tracker trace"
            );
        }
    }
}

impl CatchUpHook for RaceTrackerCatchUpHook {
    fn on_before_catch_up(&mut self) {
        self.worker = WorkerId::current();
    }

    fn on_before_event(&mut self, envelope: &EventEnvelope) {
        self.in_critical_section = true;
        self.trace(
            TraceEntryType::InCriticalSection,
            TracePayload::event(&self.projection, envelope),
        );
    }

    fn on_before_batch_completed(&mut self) {
        if !self.in_critical_section {
            return;
        }
        self.trace(
            TraceEntryType::LockWillBeReleased,
            TracePayload::projection(&self.projection),
        );
        self.in_critical_section = false;
    }
}

/// Builds a [`RaceTrackerCatchUpHook`] per catch-up run.
#[derive(Debug, Clone)]
pub struct RaceTrackerHookFactory {
    tracker: RaceTracker,
}

impl RaceTrackerHookFactory {
    pub fn new(tracker: RaceTracker) -> Self {
        Self { tracker }
    }

    pub fn into_arc(self) -> Arc<dyn CatchUpHookFactory> {
        Arc::new(self)
    }
}

impl CatchUpHookFactory for RaceTrackerHookFactory {
    fn build(&self, projection: &ProjectionId) -> Box<dyn CatchUpHook> {
        Box::new(RaceTrackerCatchUpHook::new(self.tracker.clone(), projection.clone()))
    }
}

#[cfg(test)]
mod tests {
    use escr_core::{EventId, SequenceNumber, StreamName};
    use escr_events::Event;

    use super::*;
    use crate::trace::TraceEntryType::{InCriticalSection, LockWillBeReleased};

    fn envelope(seq: u64) -> EventEnvelope {
        EventEnvelope::new(
            Event::new(EventId::new(), "NodeWasCreated", serde_json::json!({})),
            StreamName::new("workspace").unwrap(),
            seq,
            SequenceNumber::new(seq),
            Default::default(),
        )
    }

    #[test]
    fn release_is_traced_only_after_entering() {
        let tracker = RaceTracker::in_memory();
        let mut hook = RaceTrackerHookFactory::new(tracker.clone()).build(&ProjectionId::new("graph").unwrap());

        hook.on_before_catch_up();
        // Idle batch: nothing applied, no release marker.
        hook.on_before_batch_completed();
        hook.on_before_event(&envelope(1));
        hook.on_after_event(&envelope(1));
        hook.on_before_event(&envelope(2));
        hook.on_before_batch_completed();
        hook.on_before_batch_completed();
        hook.on_after_catch_up();

        let types: Vec<_> = tracker
            .traces()
            .unwrap()
            .entries()
            .iter()
            .map(|e| e.entry_type)
            .collect();
        assert_eq!(types, vec![InCriticalSection, InCriticalSection, LockWillBeReleased]);
        assert!(tracker.traces().unwrap().verify().is_ok());
    }
}
