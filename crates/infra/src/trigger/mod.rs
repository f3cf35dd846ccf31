//! Starting projection catch-ups after a commit.
//!
//! A trigger is told which projections have new work. How and where the
//! catch-up then runs is up to the implementation:
//!
//! | Trigger | Runs catch-up | Caller waits |
//! |---------|---------------|--------------|
//! | [`SynchronousCatchUpTrigger`] | on the calling thread | yes |
//! | [`RegistryCatchUpTrigger`] | on the calling thread, repository resolved at run time | yes |
//! | [`SpawningCatchUpTrigger`] + [`ThreadSpawner`] | on a new thread per projection | no |
//! | [`SpawningCatchUpTrigger`] + [`ProcessSpawner`] | in a new worker process per projection | no |
//! | [`CoalescingCatchUpTrigger`] | on one thread per projection, repeated triggers merged | no |
//!
//! Asynchronous triggers may start several catch-ups of the same projection
//! at once; the projection lock serializes them. [`CoalescingCatchUpTrigger`]
//! avoids the redundant runs inside one process.

use std::sync::Arc;

use thiserror::Error;
use tracing::error;

use escr_core::ProjectionId;

use crate::catch_up::{CatchUpError, CatchUpOptions};
use crate::content_repository::ContentRepository;
use crate::registry::RegistryError;

pub mod coalescing;
pub mod registry;
pub mod spawning;
pub mod synchronous;
pub mod with_synchronous_option;

pub use coalescing::CoalescingCatchUpTrigger;
pub use registry::RegistryCatchUpTrigger;
pub use spawning::{CatchUpTask, ProcessSpawner, SpawningCatchUpTrigger, TaskSpawner, ThreadSpawner};
pub use synchronous::SynchronousCatchUpTrigger;
pub use with_synchronous_option::CatchUpTriggerWithSynchronousOption;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("catch-up of {} projection(s) failed: {}", .0.len(), describe(.0))]
    CatchUpFailed(Vec<(ProjectionId, CatchUpError)>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to start catch-up of projection '{projection}': {message}")]
    Spawn {
        projection: ProjectionId,
        message: String,
    },
}

fn describe(failures: &[(ProjectionId, CatchUpError)]) -> String {
    failures
        .iter()
        .map(|(projection, err)| format!("{projection}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Starts catch-up for projections that have pending events.
pub trait ProjectionCatchUpTrigger: Send + Sync {
    fn trigger_catch_up(&self, projections: &[ProjectionId]) -> Result<(), TriggerError>;
}

impl<T> ProjectionCatchUpTrigger for Arc<T>
where
    T: ProjectionCatchUpTrigger + ?Sized,
{
    fn trigger_catch_up(&self, projections: &[ProjectionId]) -> Result<(), TriggerError> {
        (**self).trigger_catch_up(projections)
    }
}

/// Catch up each projection in turn; a failure does not stop the others.
pub(crate) fn catch_up_each(
    repository: &ContentRepository,
    projections: &[ProjectionId],
    options: &CatchUpOptions,
) -> Result<(), TriggerError> {
    let mut failures = Vec::new();
    for projection in projections {
        if let Err(err) = repository.catch_up_projection(projection, options) {
            error!(repository = %repository.id(), projection = %projection, error = %err, "catch-up failed");
            failures.push((projection.clone(), err));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(TriggerError::CatchUpFailed(failures))
    }
}
