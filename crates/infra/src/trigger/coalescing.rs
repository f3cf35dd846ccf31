//! At most one catch-up worker per projection and process.
//!
//! Triggers that arrive while a projection's worker is running only mark it
//! dirty; the worker runs once more when it finishes. Any number of triggers
//! during a run collapse into that single extra run, which still picks up
//! every event committed before them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use escr_core::ProjectionId;

use super::{ProjectionCatchUpTrigger, TriggerError};
use crate::catch_up::CatchUpOptions;
use crate::content_repository::ContentRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run {
    Running,
    /// Triggered again while running.
    RunningDirty,
}

type Runs = Arc<Mutex<HashMap<ProjectionId, Run>>>;

#[derive(Debug)]
pub struct CoalescingCatchUpTrigger {
    repository: Arc<ContentRepository>,
    options: CatchUpOptions,
    runs: Runs,
}

impl CoalescingCatchUpTrigger {
    pub fn new(repository: Arc<ContentRepository>) -> Self {
        Self {
            repository,
            options: CatchUpOptions::default(),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_options(mut self, options: CatchUpOptions) -> Self {
        self.options = options;
        self
    }

    /// Whether no worker is running. Mostly useful in tests.
    pub fn is_idle(&self) -> bool {
        self.runs.lock().map(|runs| runs.is_empty()).unwrap_or(false)
    }

    /// Wait until all workers have finished, up to `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn start_worker(&self, projection: &ProjectionId) -> Result<(), TriggerError> {
        let repository = self.repository.clone();
        let options = self.options.clone();
        let runs = self.runs.clone();
        let target = projection.clone();

        thread::Builder::new()
            .name(format!("catch-up-{projection}"))
            .spawn(move || worker(&repository, &target, &options, &runs))
            .map(|_| ())
            .map_err(|e| TriggerError::Spawn {
                projection: projection.clone(),
                message: e.to_string(),
            })
    }
}

fn worker(repository: &ContentRepository, projection: &ProjectionId, options: &CatchUpOptions, runs: &Runs) {
    loop {
        if let Err(err) = repository.catch_up_projection(projection, options) {
            error!(repository = %repository.id(), projection = %projection, error = %err, "catch-up failed");
        }

        let Ok(mut runs) = runs.lock() else {
            error!(projection = %projection, "catch-up run table poisoned");
            return;
        };
        if runs.get(projection) == Some(&Run::RunningDirty) {
            runs.insert(projection.clone(), Run::Running);
            debug!(projection = %projection, "re-running coalesced catch-up");
        } else {
            runs.remove(projection);
            return;
        }
    }
}

impl ProjectionCatchUpTrigger for CoalescingCatchUpTrigger {
    fn trigger_catch_up(&self, projections: &[ProjectionId]) -> Result<(), TriggerError> {
        let mut first_failure = None;
        for projection in projections {
            {
                let mut runs = self.runs.lock().map_err(|_| TriggerError::Spawn {
                    projection: projection.clone(),
                    message: "catch-up run table poisoned".to_string(),
                })?;
                if let Some(run) = runs.get_mut(projection) {
                    *run = Run::RunningDirty;
                    debug!(projection = %projection, "catch-up already running; coalesced");
                    continue;
                }
                runs.insert(projection.clone(), Run::Running);
            }

            if let Err(err) = self.start_worker(projection) {
                if let Ok(mut runs) = self.runs.lock() {
                    runs.remove(projection);
                }
                first_failure.get_or_insert(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use serde_json::json;

    use escr_core::{ContentRepositoryId, EventId, ExpectedVersion, SequenceNumber, StreamName};
    use escr_events::{ApplyError, Event, EventEnvelope, Projection};

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::event_store::{EventStore, InMemoryEventStore};

    /// Blocks inside `apply` until the test lets it continue.
    struct Gated {
        id: ProjectionId,
        applied: AtomicUsize,
        entered: Mutex<mpsc::Sender<()>>,
        proceed: Mutex<mpsc::Receiver<()>>,
    }

    impl Projection for Gated {
        fn id(&self) -> &ProjectionId {
            &self.id
        }

        fn can_handle(&self, _event: &Event) -> bool {
            true
        }

        fn apply(&self, _envelope: &EventEnvelope) -> Result<(), ApplyError> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.proceed.lock().unwrap().recv();
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn reset(&self) -> Result<(), ApplyError> {
            Ok(())
        }
    }

    #[test]
    fn triggers_during_a_run_collapse_into_one_rerun() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let projection = Arc::new(Gated {
            id: ProjectionId::new("graph").unwrap(),
            applied: AtomicUsize::new(0),
            entered: Mutex::new(entered_tx),
            proceed: Mutex::new(proceed_rx),
        });
        let repository = Arc::new(
            ContentRepository::builder(
                ContentRepositoryId::new("default").unwrap(),
                Arc::new(InMemoryEventStore::new()),
                Arc::new(InMemoryCheckpointStore::new()),
            )
            .with_projection(projection.clone())
            .unwrap()
            .build(),
        );
        let stream = StreamName::new("s").unwrap();
        let commit = |n: u64| {
            repository
                .event_store()
                .commit(
                    &stream,
                    &[Event::new(EventId::new(), "NodeWasCreated", json!({}))],
                    ExpectedVersion::Exact(n),
                )
                .unwrap();
        };
        let trigger = CoalescingCatchUpTrigger::new(repository.clone());
        let graph = [projection.id().clone()];

        commit(0);
        trigger.trigger_catch_up(&graph).unwrap();
        entered_rx.recv().unwrap();

        // The worker is inside `apply` of event 1; these only mark it dirty.
        commit(1);
        trigger.trigger_catch_up(&graph).unwrap();
        trigger.trigger_catch_up(&graph).unwrap();
        assert!(!trigger.is_idle());

        proceed_tx.send(()).unwrap();
        entered_rx.recv().unwrap();
        proceed_tx.send(()).unwrap();

        assert!(trigger.wait_idle(Duration::from_secs(5)));
        assert_eq!(projection.applied.load(Ordering::SeqCst), 2);
        assert_eq!(
            repository
                .projection_sequence_number(projection.id())
                .unwrap(),
            SequenceNumber::new(2)
        );
    }
}
