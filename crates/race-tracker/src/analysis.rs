//! Offline analysis of a collected trace.
//!
//! Both checks are pure functions of log order; timestamps play no part.
//! Entries are grouped by projection, since different projections are allowed
//! to catch up in parallel and to apply the same event.
//!
//! - **Concurrency violations**: walking the trace, keep the set of workers
//!   inside each projection's critical section. A worker entering while another
//!   worker is inside is a violation. `LockWillBeReleased` takes the worker out.
//! - **Duplicate processing**: an `(event id, sequence number)` pair entering a
//!   projection's critical section more than once was applied more than once.
//!   Every repetition is reported.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use escr_core::{EventId, ProjectionId, SequenceNumber};

use crate::trace::{LogPosition, TraceEntry, TraceEntryType, WorkerId};

/// A worker entered a projection's critical section while others were inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyViolation {
    pub projection: ProjectionId,
    pub position: LogPosition,
    pub entering: WorkerId,
    pub sequence_number: Option<SequenceNumber>,
    /// Workers inside at that point, excluding `entering`.
    pub already_inside: Vec<WorkerId>,
}

impl core::fmt::Display for ConcurrencyViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inside: Vec<&str> = self.already_inside.iter().map(WorkerId::as_str).collect();
        write!(
            f,
            "projection {}: worker {} entered the critical section at {}",
            self.projection, self.entering, self.position
        )?;
        if let Some(seq) = self.sequence_number {
            write!(f, " (seq {seq})")?;
        }
        write!(f, " while {} held it", inside.join(", "))
    }
}

/// The same event entered a projection's critical section again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateProcessing {
    pub projection: ProjectionId,
    pub event_id: EventId,
    pub sequence_number: SequenceNumber,
    pub first: (LogPosition, WorkerId),
    pub repeated: (LogPosition, WorkerId),
}

impl core::fmt::Display for DuplicateProcessing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "projection {}: event {} (seq {}) applied by {} at {} and again by {} at {}",
            self.projection,
            self.event_id,
            self.sequence_number,
            self.first.1,
            self.first.0,
            self.repeated.1,
            self.repeated.0
        )
    }
}

/// Everything wrong with a trace. Returned by [`TraceEntries::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct RaceReport {
    pub concurrency_violations: Vec<ConcurrencyViolation>,
    pub duplicate_processing: Vec<DuplicateProcessing>,
}

impl core::fmt::Display for RaceReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "race tracker found {} concurrency violation(s) and {} duplicate(s)",
            self.concurrency_violations.len(),
            self.duplicate_processing.len()
        )?;
        for violation in &self.concurrency_violations {
            write!(f, "\n  - {violation}")?;
        }
        for duplicate in &self.duplicate_processing {
            write!(f, "\n  - {duplicate}")?;
        }
        Ok(())
    }
}

/// An ordered trace, as read back from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceEntries {
    entries: Vec<TraceEntry>,
}

impl TraceEntries {
    pub fn new(entries: Vec<TraceEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of `InCriticalSection` entries.
    pub fn critical_sections(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.entry_type == TraceEntryType::InCriticalSection)
            .count()
    }

    pub fn concurrency_violations(&self) -> Vec<ConcurrencyViolation> {
        let mut inside: HashMap<&ProjectionId, BTreeSet<&WorkerId>> = HashMap::new();
        let mut violations = Vec::new();

        for entry in &self.entries {
            let workers = inside.entry(entry.projection()).or_default();
            match entry.entry_type {
                TraceEntryType::InCriticalSection => {
                    let others: Vec<WorkerId> = workers
                        .iter()
                        .filter(|w| **w != &entry.worker)
                        .map(|w| (*w).clone())
                        .collect();
                    if !others.is_empty() {
                        violations.push(ConcurrencyViolation {
                            projection: entry.projection().clone(),
                            position: entry.position.clone(),
                            entering: entry.worker.clone(),
                            sequence_number: entry.payload.sequence_number,
                            already_inside: others,
                        });
                    }
                    workers.insert(&entry.worker);
                }
                TraceEntryType::LockWillBeReleased => {
                    workers.remove(&entry.worker);
                }
            }
        }
        violations
    }

    pub fn duplicate_processing(&self) -> Vec<DuplicateProcessing> {
        let mut seen: HashMap<(&ProjectionId, EventId, SequenceNumber), &TraceEntry> = HashMap::new();
        let mut duplicates = Vec::new();

        for entry in &self.entries {
            if entry.entry_type != TraceEntryType::InCriticalSection {
                continue;
            }
            let Some((event_id, sequence_number)) = entry.payload.processed_event() else {
                continue;
            };
            match seen.get(&(entry.projection(), event_id, sequence_number)) {
                Some(first) => duplicates.push(DuplicateProcessing {
                    projection: entry.projection().clone(),
                    event_id,
                    sequence_number,
                    first: (first.position.clone(), first.worker.clone()),
                    repeated: (entry.position.clone(), entry.worker.clone()),
                }),
                None => {
                    seen.insert((entry.projection(), event_id, sequence_number), entry);
                }
            }
        }
        duplicates
    }

    /// `Ok` when neither check finds anything.
    pub fn verify(&self) -> Result<(), RaceReport> {
        let report = RaceReport {
            concurrency_violations: self.concurrency_violations(),
            duplicate_processing: self.duplicate_processing(),
        };
        if report.concurrency_violations.is_empty() && report.duplicate_processing.is_empty() {
            Ok(())
        } else {
            Err(report)
        }
    }
}

impl From<Vec<TraceEntry>> for TraceEntries {
    fn from(entries: Vec<TraceEntry>) -> Self {
        Self::new(entries)
    }
}

impl<'a> IntoIterator for &'a TraceEntries {
    type Item = &'a TraceEntry;
    type IntoIter = std::slice::Iter<'a, TraceEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use crate::trace::TracePayload;

    use super::*;

    fn graph() -> ProjectionId {
        ProjectionId::new("graph").unwrap()
    }

    fn enter(position: usize, worker: &str, projection: &ProjectionId, event: (EventId, u64)) -> TraceEntry {
        TraceEntry::new(
            LogPosition::new(position.to_string()),
            WorkerId::new(worker),
            TraceEntryType::InCriticalSection,
            TracePayload {
                projection: projection.clone(),
                event_type: Some("NodeWasCreated".into()),
                sequence_number: Some(SequenceNumber::new(event.1)),
                event_id: Some(event.0),
            },
        )
    }

    fn release(position: usize, worker: &str, projection: &ProjectionId) -> TraceEntry {
        TraceEntry::new(
            LogPosition::new(position.to_string()),
            WorkerId::new(worker),
            TraceEntryType::LockWillBeReleased,
            TracePayload::projection(projection),
        )
    }

    #[test]
    fn one_worker_entering_repeatedly_within_a_batch_is_fine() {
        let (e1, e2) = (EventId::new(), EventId::new());
        let trace = TraceEntries::new(vec![
            enter(0, "p1", &graph(), (e1, 1)),
            enter(1, "p1", &graph(), (e2, 2)),
            release(2, "p1", &graph()),
        ]);
        assert!(trace.verify().is_ok());
        assert_eq!(trace.critical_sections(), 2);
    }

    #[test]
    fn projections_are_analysed_independently() {
        let event = EventId::new();
        let other = ProjectionId::new("assets").unwrap();
        let trace = TraceEntries::new(vec![
            enter(0, "p1", &graph(), (event, 1)),
            enter(1, "p2", &other, (event, 1)),
            release(2, "p2", &other),
            release(3, "p1", &graph()),
        ]);
        assert!(trace.concurrency_violations().is_empty());
        assert!(trace.duplicate_processing().is_empty());
    }

    #[test]
    fn every_repetition_is_reported() {
        let event = EventId::new();
        let trace = TraceEntries::new(vec![
            enter(0, "p1", &graph(), (event, 7)),
            release(1, "p1", &graph()),
            enter(2, "p2", &graph(), (event, 7)),
            release(3, "p2", &graph()),
            enter(4, "p3", &graph(), (event, 7)),
            release(5, "p3", &graph()),
        ]);
        let duplicates = trace.duplicate_processing();
        assert_eq!(duplicates.len(), 2);
        assert!(duplicates.iter().all(|d| d.first.1 == WorkerId::new("p1")));
        assert!(trace.concurrency_violations().is_empty());
    }

    #[test]
    fn report_lists_every_finding() {
        let event = EventId::new();
        let trace = TraceEntries::new(vec![
            enter(0, "p1", &graph(), (event, 1)),
            enter(1, "p2", &graph(), (event, 1)),
            release(2, "p1", &graph()),
            release(3, "p2", &graph()),
        ]);
        let report = trace.verify().unwrap_err();
        assert_eq!(report.concurrency_violations.len(), 1);
        assert_eq!(report.duplicate_processing.len(), 1);

        let text = report.to_string();
        assert!(text.contains("1 concurrency violation(s) and 1 duplicate(s)"));
        assert!(text.contains("worker p2 entered the critical section at 1 (seq 1) while p1 held it"));
    }
}
