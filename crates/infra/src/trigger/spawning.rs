//! Fire-and-forget catch-up: every triggered projection gets its own worker.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use escr_core::{ContentRepositoryId, ProjectionId};

use super::{ProjectionCatchUpTrigger, TriggerError};
use crate::catch_up::CatchUpOptions;
use crate::registry::ContentRepositoryRegistry;

/// One unit of catch-up work handed to a spawner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpTask {
    pub repository_id: ContentRepositoryId,
    pub projection: ProjectionId,
}

/// Starts a catch-up somewhere else and returns without waiting for it.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: CatchUpTask) -> Result<(), TriggerError>;
}

#[derive(Debug)]
pub struct SpawningCatchUpTrigger<S> {
    spawner: S,
    repository_id: ContentRepositoryId,
}

impl<S: TaskSpawner> SpawningCatchUpTrigger<S> {
    pub fn new(spawner: S, repository_id: ContentRepositoryId) -> Self {
        Self {
            spawner,
            repository_id,
        }
    }
}

impl<S: TaskSpawner> ProjectionCatchUpTrigger for SpawningCatchUpTrigger<S> {
    /// Spawns one worker per projection. If a spawn fails the remaining
    /// projections are still spawned and the first failure is returned.
    fn trigger_catch_up(&self, projections: &[ProjectionId]) -> Result<(), TriggerError> {
        let mut first_failure = None;
        for projection in projections {
            let task = CatchUpTask {
                repository_id: self.repository_id.clone(),
                projection: projection.clone(),
            };
            if let Err(err) = self.spawner.spawn(task) {
                error!(projection = %projection, error = %err, "failed to spawn catch-up");
                first_failure.get_or_insert(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

/// Runs each catch-up on a fresh OS thread of this process.
#[derive(Debug)]
pub struct ThreadSpawner {
    registry: Arc<ContentRepositoryRegistry>,
    options: CatchUpOptions,
}

impl ThreadSpawner {
    pub fn new(registry: Arc<ContentRepositoryRegistry>) -> Self {
        Self {
            registry,
            options: CatchUpOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CatchUpOptions) -> Self {
        self.options = options;
        self
    }
}

impl TaskSpawner for ThreadSpawner {
    fn spawn(&self, task: CatchUpTask) -> Result<(), TriggerError> {
        let registry = self.registry.clone();
        let options = self.options.clone();
        let projection = task.projection.clone();

        thread::Builder::new()
            .name(format!("catch-up-{}", task.projection))
            .spawn(move || run_task(&registry, &task, &options))
            .map(|_| ())
            .map_err(|e| TriggerError::Spawn {
                projection,
                message: e.to_string(),
            })
    }
}

fn run_task(registry: &ContentRepositoryRegistry, task: &CatchUpTask, options: &CatchUpOptions) {
    let repository = match registry.get(&task.repository_id) {
        Ok(repository) => repository,
        Err(err) => {
            error!(repository = %task.repository_id, projection = %task.projection, error = %err, "catch-up worker cannot resolve repository");
            return;
        }
    };
    match repository.catch_up_projection(&task.projection, options) {
        Ok(report) => debug!(projection = %task.projection, applied = report.applied, "catch-up worker finished"),
        Err(err) => error!(repository = %task.repository_id, projection = %task.projection, error = %err, "catch-up worker failed"),
    }
}

/// Runs each catch-up in a separate worker process.
///
/// The worker is invoked as
/// `<program> <args..> --content-repository <id> --projection <id>` with
/// stdio detached. Its exit status is only logged.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn command(&self, task: &CatchUpTask) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--content-repository")
            .arg(task.repository_id.as_str())
            .arg("--projection")
            .arg(task.projection.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

impl TaskSpawner for ProcessSpawner {
    fn spawn(&self, task: CatchUpTask) -> Result<(), TriggerError> {
        let mut child = self.command(&task).spawn().map_err(|e| TriggerError::Spawn {
            projection: task.projection.clone(),
            message: format!("{}: {e}", self.program.display()),
        })?;
        info!(projection = %task.projection, pid = child.id(), "catch-up worker process started");

        // Reap the child so it does not linger as a zombie.
        let projection = task.projection;
        let reaper = thread::Builder::new()
            .name(format!("reap-{projection}"))
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => {
                    debug!(projection = %projection, "catch-up worker process exited");
                }
                Ok(status) => {
                    warn!(projection = %projection, status = %status, "catch-up worker process failed");
                }
                Err(err) => {
                    warn!(projection = %projection, error = %err, "failed to wait for catch-up worker process");
                }
            });
        if let Err(err) = reaper {
            warn!(error = %err, "failed to start reaper thread for catch-up worker");
        }
        Ok(())
    }
}
