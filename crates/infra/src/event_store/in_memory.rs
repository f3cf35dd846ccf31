use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use escr_core::{ExpectedVersion, SequenceNumber, StreamName};
use escr_events::{Event, EventEnvelope};

use super::r#trait::{CommitResult, EventStore, EventStoreError, LogRange};

#[derive(Debug, Default)]
struct Log {
    /// Index `i` holds sequence number `i + 1`.
    events: Vec<EventEnvelope>,
    stream_versions: HashMap<StreamName, u64>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Commits are serialized by the write lock, which
/// keeps every batch contiguous in the global log.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn commit(
        &self,
        stream_name: &StreamName,
        events: &[Event],
        expected_version: ExpectedVersion,
    ) -> Result<CommitResult, EventStoreError> {
        let mut log = self
            .log
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let current = log.stream_versions.get(stream_name).copied().unwrap_or(0);
        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream '{stream_name}': expected {expected_version:?}, found {current}"
            )));
        }

        let mut version = current;
        let mut seq = SequenceNumber::new(log.events.len() as u64);
        let recorded_at = Utc::now();
        for event in events {
            version += 1;
            seq = seq.next();
            log.events.push(EventEnvelope::new(
                event.clone(),
                stream_name.clone(),
                version,
                seq,
                recorded_at,
            ));
        }
        if !events.is_empty() {
            log.stream_versions.insert(stream_name.clone(), version);
        }

        Ok(CommitResult {
            highest_committed_version: version,
            highest_committed_sequence_number: seq,
        })
    }

    fn load_stream(&self, stream_name: &StreamName) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        Ok(log
            .events
            .iter()
            .filter(|e| e.stream_name() == stream_name)
            .cloned()
            .collect())
    }

    fn load_all(&self, range: LogRange) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let start = (range.start_after().value() as usize).min(log.events.len());
        let end = range
            .upper_bound()
            .map(|up_to| (up_to.value() as usize).min(log.events.len()))
            .unwrap_or(log.events.len())
            .max(start);
        let end = match range.max_events() {
            Some(limit) => end.min(start.saturating_add(limit)),
            None => end,
        };

        Ok(log.events[start..end].to_vec())
    }

    fn highest_sequence_number(&self) -> Result<SequenceNumber, EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(SequenceNumber::new(log.events.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use escr_core::EventId;
    use serde_json::json;

    use super::*;

    fn stream(name: &str) -> StreamName {
        StreamName::new(name).unwrap()
    }

    fn events(n: usize) -> Vec<Event> {
        (0..n)
            .map(|i| Event::new(EventId::new(), "NodeWasCreated", json!({ "i": i })))
            .collect()
    }

    #[test]
    fn commit_assigns_contiguous_global_sequence_numbers() {
        let store = InMemoryEventStore::new();

        let first = store
            .commit(&stream("a"), &events(2), ExpectedVersion::NoStream)
            .unwrap();
        let second = store
            .commit(&stream("b"), &events(3), ExpectedVersion::NoStream)
            .unwrap();

        assert_eq!(first.highest_committed_sequence_number, SequenceNumber::new(2));
        assert_eq!(first.highest_committed_version, 2);
        assert_eq!(second.highest_committed_sequence_number, SequenceNumber::new(5));
        assert_eq!(second.highest_committed_version, 3);

        let all = store.load_all(LogRange::after(SequenceNumber::none())).unwrap();
        let seqs: Vec<u64> = all.iter().map(|e| e.sequence_number().value()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn commit_rejects_stale_expected_version() {
        let store = InMemoryEventStore::new();
        store
            .commit(&stream("a"), &events(1), ExpectedVersion::NoStream)
            .unwrap();

        let err = store
            .commit(&stream("a"), &events(1), ExpectedVersion::NoStream)
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        store
            .commit(&stream("a"), &events(1), ExpectedVersion::Exact(1))
            .unwrap();
        assert_eq!(store.load_stream(&stream("a")).unwrap().len(), 2);
    }

    #[test]
    fn load_all_honours_range_and_limit() {
        let store = InMemoryEventStore::new();
        store
            .commit(&stream("a"), &events(10), ExpectedVersion::Any)
            .unwrap();

        let range = LogRange::after(SequenceNumber::new(2))
            .up_to(Some(SequenceNumber::new(8)))
            .limit(Some(4));
        let seqs: Vec<u64> = store
            .load_all(range)
            .unwrap()
            .iter()
            .map(|e| e.sequence_number().value())
            .collect();
        assert_eq!(seqs, vec![3, 4, 5, 6]);

        assert!(store
            .load_all(LogRange::after(SequenceNumber::new(10)))
            .unwrap()
            .is_empty());
        assert!(store
            .load_all(LogRange::after(SequenceNumber::new(50)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn concurrent_commits_never_interleave() {
        let store = Arc::new(InMemoryEventStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    let name = stream(&format!("s{i}"));
                    store.commit(&name, &events(5), ExpectedVersion::Any).unwrap()
                })
            })
            .collect();

        for handle in handles {
            let result = handle.join().unwrap();
            let highest = result.highest_committed_sequence_number;
            let start = highest.batch_start(5).unwrap();
            let batch = store
                .load_all(LogRange::after(SequenceNumber::new(start.value() - 1)).limit(Some(5)))
                .unwrap();
            let streams: std::collections::HashSet<_> =
                batch.iter().map(|e| e.stream_name().clone()).collect();
            assert_eq!(streams.len(), 1, "batch ending at {highest} was interleaved");
        }
        assert_eq!(store.highest_sequence_number().unwrap(), SequenceNumber::new(40));
    }
}
