//! Bringing one projection up to date with the global log.
//!
//! A catch-up run processes the log in batches. Each batch is one critical
//! section of the projection's lock:
//!
//! ```text
//!            acquire_lock                 update_and_release_lock
//!   Idle ───────────────────> Locked ─────────────────────────────> Idle
//!                               │
//!                               │ apply failed (checkpoint = last success,
//!                               ▼             lock released)
//!                             Failed
//! ```
//!
//! Events the projection cannot handle are skipped but still advance the
//! checkpoint; handled events are wrapped in `on_before_event` /
//! `on_after_event`.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use escr_core::{ProjectionId, SequenceNumber};
use escr_events::{ApplyError, CatchUpHook, EventEnvelope, NoopCatchUpHook, Projection, ProjectionsError};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::event_store::{EventStore, EventStoreError, LogRange};

/// Called for every event a catch-up reads, handled or not.
pub type ProgressCallback = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Tuning knobs of a catch-up run.
#[derive(Clone)]
pub struct CatchUpOptions {
    batch_size: Option<usize>,
    maximum_sequence_number: Option<SequenceNumber>,
    progress: Option<ProgressCallback>,
    run_hooks: bool,
}

impl Default for CatchUpOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            maximum_sequence_number: None,
            progress: None,
            run_hooks: true,
        }
    }
}

impl CatchUpOptions {
    /// Release and re-acquire the lock every `batch_size` events.
    ///
    /// `0` means "no limit": the whole pending range is one batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = (batch_size > 0).then_some(batch_size);
        self
    }

    /// Stop after applying up to (and including) `max`.
    pub fn with_maximum_sequence_number(mut self, max: SequenceNumber) -> Self {
        self.maximum_sequence_number = Some(max);
        self
    }

    pub fn with_progress_callback(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Skip all registered catch-up hooks (used when replaying).
    pub fn without_hooks(mut self) -> Self {
        self.run_hooks = false;
        self
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    pub fn maximum_sequence_number(&self) -> Option<SequenceNumber> {
        self.maximum_sequence_number
    }

    pub fn runs_hooks(&self) -> bool {
        self.run_hooks
    }
}

impl core::fmt::Debug for CatchUpOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CatchUpOptions")
            .field("batch_size", &self.batch_size)
            .field("maximum_sequence_number", &self.maximum_sequence_number)
            .field("progress", &self.progress.is_some())
            .field("run_hooks", &self.run_hooks)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpState {
    Idle,
    Locked,
    Failed,
}

/// What a successful catch-up did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpReport {
    pub projection: ProjectionId,
    pub applied: usize,
    pub skipped: usize,
    pub batches: usize,
    pub checkpoint: SequenceNumber,
}

#[derive(Debug, Error)]
pub enum CatchUpError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    UnknownProjection(#[from] ProjectionsError),

    #[error("projection '{projection}' failed to apply event {sequence_number}: {source}")]
    Apply {
        projection: ProjectionId,
        sequence_number: SequenceNumber,
        #[source]
        source: ApplyError,
    },

    #[error("event store returned event {found} after checkpoint {checkpoint}")]
    NonMonotonicSequence {
        checkpoint: SequenceNumber,
        found: SequenceNumber,
    },
}

enum BatchOutcome {
    More,
    Done,
}

/// Releases the projection lock if a batch is abandoned without an explicit
/// release (early return or panic in `apply`).
struct HeldLock<'a> {
    store: &'a dyn CheckpointStore,
    projection: &'a ProjectionId,
    held: bool,
}

impl<'a> HeldLock<'a> {
    fn new(store: &'a dyn CheckpointStore, projection: &'a ProjectionId) -> Self {
        Self {
            store,
            projection,
            held: true,
        }
    }

    fn update_and_release(mut self, applied: SequenceNumber) -> Result<(), CheckpointError> {
        self.held = false;
        self.store.update_and_release_lock(self.projection, applied)
    }

    fn release(mut self) -> Result<(), CheckpointError> {
        self.held = false;
        self.store.release_lock(self.projection)
    }
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        if self.held {
            if let Err(err) = self.store.release_lock(self.projection) {
                warn!(projection = %self.projection, error = %err, "failed to release abandoned projection lock");
            }
        }
    }
}

/// One catch-up run of one projection.
pub struct ProjectionCatchUp<'a> {
    projection: &'a dyn Projection,
    events: &'a dyn EventStore,
    checkpoints: &'a dyn CheckpointStore,
    hook: Box<dyn CatchUpHook>,
    options: CatchUpOptions,
    state: CatchUpState,
}

impl<'a> ProjectionCatchUp<'a> {
    pub fn new(
        projection: &'a dyn Projection,
        events: &'a dyn EventStore,
        checkpoints: &'a dyn CheckpointStore,
    ) -> Self {
        Self {
            projection,
            events,
            checkpoints,
            hook: Box::new(NoopCatchUpHook),
            options: CatchUpOptions::default(),
            state: CatchUpState::Idle,
        }
    }

    /// Hook invoked around the run. Ignored when the options disable hooks.
    pub fn with_hook(mut self, hook: Box<dyn CatchUpHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_options(mut self, options: CatchUpOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> CatchUpState {
        self.state
    }

    /// Apply everything after the projection's checkpoint.
    ///
    /// On failure the state stays [`CatchUpState::Failed`], the checkpoint
    /// points at the last event applied successfully, and the lock is free.
    pub fn run(&mut self) -> Result<CatchUpReport, CatchUpError> {
        if !self.options.run_hooks {
            self.hook = Box::new(NoopCatchUpHook);
        }

        let projection = self.projection.id().clone();
        let mut report = CatchUpReport {
            projection: projection.clone(),
            applied: 0,
            skipped: 0,
            batches: 0,
            checkpoint: SequenceNumber::none(),
        };

        self.hook.on_before_catch_up();
        loop {
            match self.run_batch(&mut report) {
                Ok(BatchOutcome::More) => continue,
                Ok(BatchOutcome::Done) => break,
                Err(err) => {
                    self.state = CatchUpState::Failed;
                    error!(projection = %projection, error = %err, "projection catch-up failed");
                    return Err(err);
                }
            }
        }
        self.hook.on_after_catch_up();

        if report.applied > 0 || report.skipped > 0 {
            info!(
                projection = %projection,
                applied = report.applied,
                skipped = report.skipped,
                batches = report.batches,
                checkpoint = %report.checkpoint,
                "projection caught up"
            );
        }
        Ok(report)
    }

    fn run_batch(&mut self, report: &mut CatchUpReport) -> Result<BatchOutcome, CatchUpError> {
        let projection = self.projection;
        let id = projection.id();
        let checkpoint = self.checkpoints.acquire_lock(id)?;
        let lock = HeldLock::new(self.checkpoints, id);
        self.state = CatchUpState::Locked;
        report.checkpoint = checkpoint;

        let range = LogRange::after(checkpoint)
            .up_to(self.options.maximum_sequence_number)
            .limit(self.options.batch_size);
        let batch = self.events.load_all(range)?;
        debug!(projection = %id, checkpoint = %checkpoint, events = batch.len(), "catch-up batch loaded");

        if batch.is_empty() {
            self.hook.on_before_batch_completed();
            lock.release()?;
            self.state = CatchUpState::Idle;
            return Ok(BatchOutcome::Done);
        }

        let mut applied = checkpoint;
        for envelope in &batch {
            let seq = envelope.sequence_number();
            if seq <= applied {
                self.hook.on_before_batch_completed();
                lock.update_and_release(applied)?;
                return Err(CatchUpError::NonMonotonicSequence {
                    checkpoint: applied,
                    found: seq,
                });
            }

            if let Some(progress) = &self.options.progress {
                progress(envelope);
            }

            if !projection.can_handle(envelope.event()) {
                report.skipped += 1;
                applied = seq;
                continue;
            }

            self.hook.on_before_event(envelope);
            if let Err(source) = projection.apply(envelope) {
                self.state = CatchUpState::Failed;
                self.hook.on_before_batch_completed();
                if let Err(err) = lock.update_and_release(applied) {
                    warn!(projection = %id, error = %err, "failed to store checkpoint after apply error");
                }
                report.checkpoint = applied;
                return Err(CatchUpError::Apply {
                    projection: id.clone(),
                    sequence_number: seq,
                    source,
                });
            }
            self.hook.on_after_event(envelope);
            report.applied += 1;
            applied = seq;
        }

        self.hook.on_before_batch_completed();
        lock.update_and_release(applied)?;
        self.state = CatchUpState::Idle;
        report.checkpoint = applied;
        report.batches += 1;

        let full_batch = self.options.batch_size.is_some_and(|size| batch.len() >= size);
        let reached_max = self
            .options
            .maximum_sequence_number
            .is_some_and(|max| applied >= max);
        Ok(if full_batch && !reached_max {
            BatchOutcome::More
        } else {
            BatchOutcome::Done
        })
    }
}
