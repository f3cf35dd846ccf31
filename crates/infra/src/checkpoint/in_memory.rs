use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

use escr_core::{ProjectionId, SequenceNumber};

use super::{CheckpointError, CheckpointStore, DEFAULT_LOCK_TIMEOUT};

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    applied: SequenceNumber,
    locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Locking {
    Exclusive,
    /// Every acquire succeeds; used to reproduce concurrent catch-ups.
    Disabled,
}

/// In-memory checkpoint store.
///
/// Intended for tests/dev and single-process deployments. Waiting for the
/// lock parks the thread on a condition variable instead of polling.
#[derive(Debug)]
pub struct InMemoryCheckpointStore {
    slots: Mutex<HashMap<ProjectionId, Slot>>,
    released: Condvar,
    lock_timeout: Duration,
    locking: Locking,
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            lock_timeout,
            locking: Locking::Exclusive,
        }
    }

    /// A store whose lock never excludes anyone.
    ///
    /// Only useful to demonstrate what happens without mutual exclusion: any
    /// number of catch-ups of the same projection run at once.
    pub fn without_locking() -> Self {
        Self {
            locking: Locking::Disabled,
            ..Self::new()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn slots(&self) -> Result<MutexGuard<'_, HashMap<ProjectionId, Slot>>, CheckpointError> {
        self.slots
            .lock()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))
    }

    fn release(
        &self,
        projection: &ProjectionId,
        update: impl FnOnce(&mut Slot) -> Result<(), CheckpointError>,
    ) -> Result<(), CheckpointError> {
        let mut slots = self.slots()?;
        let slot = slots.entry(projection.clone()).or_default();
        if self.locking == Locking::Exclusive && !slot.locked {
            return Err(CheckpointError::NotLocked(projection.clone()));
        }
        let result = update(slot);
        slot.locked = false;
        drop(slots);
        self.released.notify_all();
        result
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn setup(&self, projection: &ProjectionId) -> Result<(), CheckpointError> {
        self.slots()?.entry(projection.clone()).or_default();
        Ok(())
    }

    fn highest_applied_sequence_number(
        &self,
        projection: &ProjectionId,
    ) -> Result<SequenceNumber, CheckpointError> {
        Ok(self
            .slots()?
            .get(projection)
            .map(|slot| slot.applied)
            .unwrap_or_default())
    }

    fn try_acquire_lock(&self, projection: &ProjectionId) -> Result<SequenceNumber, CheckpointError> {
        let mut slots = self.slots()?;
        let slot = slots.entry(projection.clone()).or_default();
        if slot.locked && self.locking == Locking::Exclusive {
            return Err(CheckpointError::AlreadyLocked(projection.clone()));
        }
        slot.locked = true;
        Ok(slot.applied)
    }

    fn acquire_lock(&self, projection: &ProjectionId) -> Result<SequenceNumber, CheckpointError> {
        let started = Instant::now();
        let deadline = started + self.lock_timeout;
        let mut slots = self.slots()?;
        loop {
            let slot = slots.entry(projection.clone()).or_default();
            if !slot.locked || self.locking == Locking::Disabled {
                slot.locked = true;
                return Ok(slot.applied);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CheckpointError::LockTimeout {
                    projection: projection.clone(),
                    waited: now - started,
                });
            }
            slots = self
                .released
                .wait_timeout(slots, deadline - now)
                .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?
                .0;
        }
    }

    fn update_and_release_lock(
        &self,
        projection: &ProjectionId,
        applied: SequenceNumber,
    ) -> Result<(), CheckpointError> {
        let locking = self.locking;
        self.release(projection, |slot| {
            if applied >= slot.applied {
                slot.applied = applied;
                Ok(())
            } else if locking == Locking::Disabled {
                // Unsynchronized writers overlap; keep the furthest one.
                warn!(projection = %projection, current = %slot.applied, attempted = %applied, "ignoring stale checkpoint update");
                Ok(())
            } else {
                Err(CheckpointError::NonMonotonic {
                    projection: projection.clone(),
                    current: slot.applied,
                    attempted: applied,
                })
            }
        })
    }

    fn release_lock(&self, projection: &ProjectionId) -> Result<(), CheckpointError> {
        self.release(projection, |_| Ok(()))
    }

    fn reset_and_release_lock(&self, projection: &ProjectionId) -> Result<(), CheckpointError> {
        self.release(projection, |slot| {
            slot.applied = SequenceNumber::none();
            Ok(())
        })
    }
}
