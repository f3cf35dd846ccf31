//! Worker side of the subprocess catch-up trigger.
//!
//! [`ProcessSpawner`](crate::trigger::ProcessSpawner) starts
//! `<program> <args..> --content-repository <id> --projection <id>`. The
//! program registers its content repositories (it knows the projections, this
//! crate does not), parses its command line with [`WorkerArgs::parse`] and
//! hands both to [`run`]:
//!
//! ```no_run
//! # use escr_infra::{CatchUpOptions, ContentRepositoryRegistry};
//! # fn registry() -> ContentRepositoryRegistry { ContentRepositoryRegistry::new() }
//! let args = escr_infra::worker::WorkerArgs::from_env()?;
//! escr_infra::worker::run(&args, &registry(), &CatchUpOptions::default())?;
//! # Ok::<(), escr_infra::worker::WorkerError>(())
//! ```
//!
//! Leading arguments the spawner was configured with (a subcommand, say) are
//! skipped; only the two flags are read.

use thiserror::Error;
use tracing::{info, instrument};

use escr_core::{ContentRepositoryId, CoreError, ProjectionId};

use crate::catch_up::{CatchUpError, CatchUpOptions, CatchUpReport};
use crate::registry::{ContentRepositoryRegistry, RegistryError};

pub const CONTENT_REPOSITORY_FLAG: &str = "--content-repository";
pub const PROJECTION_FLAG: &str = "--projection";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("missing {0} argument")]
    MissingArgument(&'static str),

    #[error("{0} given without a value")]
    MissingValue(&'static str),

    #[error("invalid value for {flag}: {source}")]
    Invalid {
        flag: &'static str,
        #[source]
        source: CoreError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    CatchUp(#[from] CatchUpError),
}

/// What one worker process has to catch up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub repository_id: ContentRepositoryId,
    pub projection: ProjectionId,
}

impl WorkerArgs {
    /// Arguments of the current process, without the program name.
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::parse(std::env::args().skip(1))
    }

    pub fn parse<I>(args: I) -> Result<Self, WorkerError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut repository_id = None;
        let mut projection = None;

        let mut args = args.into_iter().map(Into::into);
        while let Some(arg) = args.next() {
            let (flag, slot) = match arg.as_str() {
                CONTENT_REPOSITORY_FLAG => (CONTENT_REPOSITORY_FLAG, &mut repository_id),
                PROJECTION_FLAG => (PROJECTION_FLAG, &mut projection),
                _ => continue,
            };
            *slot = Some(args.next().ok_or(WorkerError::MissingValue(flag))?);
        }

        let repository_id = repository_id.ok_or(WorkerError::MissingArgument(CONTENT_REPOSITORY_FLAG))?;
        let projection = projection.ok_or(WorkerError::MissingArgument(PROJECTION_FLAG))?;
        Ok(Self {
            repository_id: ContentRepositoryId::new(repository_id).map_err(|source| WorkerError::Invalid {
                flag: CONTENT_REPOSITORY_FLAG,
                source,
            })?,
            projection: ProjectionId::new(projection).map_err(|source| WorkerError::Invalid {
                flag: PROJECTION_FLAG,
                source,
            })?,
        })
    }
}

/// Catch up one projection of one registered repository.
#[instrument(skip_all, fields(repository = %args.repository_id, projection = %args.projection), err)]
pub fn run(
    args: &WorkerArgs,
    registry: &ContentRepositoryRegistry,
    options: &CatchUpOptions,
) -> Result<CatchUpReport, WorkerError> {
    let repository = registry.get(&args.repository_id)?;
    let report = repository.catch_up_projection(&args.projection, options)?;
    info!(
        applied = report.applied,
        checkpoint = %report.checkpoint,
        "catch-up worker finished"
    );
    Ok(report)
}
