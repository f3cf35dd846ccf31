//! Trace analysis against synthetic traces.

use escr_core::{EventId, ProjectionId, SequenceNumber};
use escr_race_tracker::{
    LogPosition, RaceTracker, TraceEntries, TraceEntry, TraceEntryType, TracePayload, WorkerId,
};
use proptest::prelude::*;

fn graph() -> ProjectionId {
    ProjectionId::new("graph").unwrap()
}

/// Builds traces with positions assigned in order.
#[derive(Default)]
struct TraceBuilder {
    entries: Vec<TraceEntry>,
}

impl TraceBuilder {
    fn push(&mut self, worker: &str, entry_type: TraceEntryType, payload: TracePayload) -> &mut Self {
        let position = LogPosition::new(format!("{}-0", self.entries.len() + 1));
        self.entries
            .push(TraceEntry::new(position, WorkerId::new(worker), entry_type, payload));
        self
    }

    fn enter(&mut self, worker: &str, event: EventId, seq: u64) -> &mut Self {
        self.push(
            worker,
            TraceEntryType::InCriticalSection,
            TracePayload {
                projection: graph(),
                event_type: Some("NodeWasCreated".into()),
                sequence_number: Some(SequenceNumber::new(seq)),
                event_id: Some(event),
            },
        )
    }

    fn release(&mut self, worker: &str) -> &mut Self {
        self.push(worker, TraceEntryType::LockWillBeReleased, TracePayload::projection(&graph()))
    }

    fn build(&mut self) -> TraceEntries {
        TraceEntries::new(std::mem::take(&mut self.entries))
    }
}

#[test]
fn serialized_critical_sections_are_not_violations() {
    let trace = TraceBuilder::default()
        .enter("p1", EventId::new(), 1)
        .release("p1")
        .enter("p2", EventId::new(), 2)
        .release("p2")
        .enter("p1", EventId::new(), 3)
        .release("p1")
        .build();

    assert!(trace.concurrency_violations().is_empty());
}

#[test]
fn overlapping_critical_sections_are_one_violation() {
    let trace = TraceBuilder::default()
        .enter("p1", EventId::new(), 1)
        .enter("p2", EventId::new(), 2)
        .release("p1")
        .release("p2")
        .build();

    let violations = trace.concurrency_violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].entering, WorkerId::new("p2"));
    assert_eq!(violations[0].already_inside, vec![WorkerId::new("p1")]);
    assert_eq!(violations[0].position, LogPosition::new("2-0"));
    assert_eq!(violations[0].sequence_number, Some(SequenceNumber::new(2)));
}

#[test]
fn repeated_event_is_one_duplicate() {
    let event = EventId::new();
    let trace = TraceBuilder::default()
        .enter("p1", event, 4)
        .release("p1")
        .enter("p2", event, 4)
        .release("p2")
        .build();

    let duplicates = trace.duplicate_processing();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].event_id, event);
    assert_eq!(duplicates[0].sequence_number, SequenceNumber::new(4));
    assert_eq!(duplicates[0].first.1, WorkerId::new("p1"));
    assert_eq!(duplicates[0].repeated.1, WorkerId::new("p2"));
}

#[test]
fn unique_events_are_not_duplicates() {
    let trace = TraceBuilder::default()
        .enter("p1", EventId::new(), 1)
        .enter("p1", EventId::new(), 2)
        .release("p1")
        .build();

    assert!(trace.duplicate_processing().is_empty());
    assert!(trace.verify().is_ok());
}

#[test]
fn reset_twice_leaves_the_log_empty() {
    let tracker = RaceTracker::in_memory();
    tracker
        .trace(TraceEntryType::InCriticalSection, TracePayload::projection(&graph()))
        .unwrap();

    tracker.reset().unwrap();
    assert!(tracker.traces().unwrap().is_empty());
    tracker.reset().unwrap();
    assert!(tracker.traces().unwrap().is_empty());
}

/// Each worker applies a run of distinct events, then releases; runs never interleave.
fn serialized_runs() -> impl Strategy<Value = Vec<(u8, u8)>> {
    prop::collection::vec((0u8..4, 1u8..5), 0..30)
}

proptest! {
    #[test]
    fn serialized_runs_never_report_anything(runs in serialized_runs()) {
        let mut builder = TraceBuilder::default();
        let mut seq = 0u64;
        for (worker, events) in &runs {
            let worker = format!("p{worker}");
            for _ in 0..*events {
                seq += 1;
                builder.enter(&worker, EventId::new(), seq);
            }
            builder.release(&worker);
        }
        let trace = builder.build();

        prop_assert!(trace.verify().is_ok());
    }

    #[test]
    fn every_reapplied_event_is_reported(
        repeats in prop::collection::vec(1usize..4, 1..10),
    ) {
        let mut builder = TraceBuilder::default();
        let mut expected = 0;
        for (i, times) in repeats.iter().enumerate() {
            let event = EventId::new();
            for _ in 0..*times {
                builder.enter("p1", event, i as u64 + 1);
                builder.release("p1");
            }
            expected += times - 1;
        }
        let trace = builder.build();

        prop_assert_eq!(trace.duplicate_processing().len(), expected);
        prop_assert!(trace.concurrency_violations().is_empty());
    }
}
