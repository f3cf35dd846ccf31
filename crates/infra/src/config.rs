//! Catch-up configuration loaded from the environment.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `ESCR_CATCHUP_TRIGGER` | `in-process` | `synchronous`, `in-process`, `thread`, `subprocess` or `coalescing` |
//! | `CATCHUPTRIGGER_ENABLE_SYNCHRONOUS_OPTION` | unset | `1`/`true` forces synchronous catch-up |
//! | `ESCR_BLOCK_POLL_INTERVAL_MS` | `50` | `CommandResult::block` poll interval |
//! | `ESCR_BLOCK_MAX_ATTEMPTS` | `100` | `CommandResult::block` attempts per projection |
//! | `ESCR_LOCK_TIMEOUT_MS` | `30000` | how long a catch-up waits for the projection lock |
//! | `ESCR_CATCHUP_BATCH_SIZE` | `0` | events per critical section, `0` = unlimited |
//! | `ESCR_CATCHUP_WORKER_PROGRAM` | unset | worker binary for `subprocess`, see [`crate::worker`] |
//! | `ESCR_CATCHUP_WORKER_ARGS` | unset | whitespace-separated leading worker arguments |
//! | `DATABASE_URL` | unset | Postgres connection string |

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use escr_core::ContentRepositoryId;

use crate::catch_up::CatchUpOptions;
use crate::command_result::BlockPolicy;
use crate::registry::{ContentRepositoryRegistry, RegistryError};
use crate::trigger::{
    CatchUpTriggerWithSynchronousOption, CoalescingCatchUpTrigger, ProcessSpawner, ProjectionCatchUpTrigger,
    RegistryCatchUpTrigger, SpawningCatchUpTrigger, SynchronousCatchUpTrigger, ThreadSpawner,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({message})")]
    Invalid {
        key: &'static str,
        value: String,
        message: String,
    },

    #[error("ESCR_CATCHUP_WORKER_PROGRAM must be set for the subprocess catch-up trigger")]
    MissingWorkerProgram,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    Synchronous,
    InProcess,
    Thread,
    Subprocess,
    Coalescing,
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synchronous" | "sync" => Ok(Self::Synchronous),
            "in-process" | "in_process" | "registry" => Ok(Self::InProcess),
            "thread" => Ok(Self::Thread),
            "subprocess" | "process" => Ok(Self::Subprocess),
            "coalescing" => Ok(Self::Coalescing),
            other => Err(format!("unknown catch-up trigger '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpConfig {
    pub trigger: TriggerKind,
    pub synchronous_option: bool,
    pub block_poll_interval_ms: u64,
    pub block_max_attempts: u32,
    pub lock_timeout_ms: u64,
    pub batch_size: usize,
    pub worker_program: Option<PathBuf>,
    pub worker_args: Vec<String>,
    pub database_url: Option<String>,
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        let block = BlockPolicy::default();
        Self {
            trigger: TriggerKind::InProcess,
            synchronous_option: false,
            block_poll_interval_ms: block.poll_interval.as_millis() as u64,
            block_max_attempts: block.max_attempts,
            lock_timeout_ms: crate::checkpoint::DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            batch_size: 0,
            worker_program: None,
            worker_args: Vec::new(),
            database_url: None,
        }
    }
}

impl CatchUpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key/value source (the environment, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("ESCR_CATCHUP_TRIGGER") {
            config.trigger = value.parse().map_err(|message| ConfigError::Invalid {
                key: "ESCR_CATCHUP_TRIGGER",
                value: value.clone(),
                message,
            })?;
        }
        if let Some(value) = lookup("CATCHUPTRIGGER_ENABLE_SYNCHRONOUS_OPTION") {
            config.synchronous_option = parse_flag("CATCHUPTRIGGER_ENABLE_SYNCHRONOUS_OPTION", &value)?;
        }
        if let Some(value) = lookup("ESCR_BLOCK_POLL_INTERVAL_MS") {
            config.block_poll_interval_ms = parse_number("ESCR_BLOCK_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("ESCR_BLOCK_MAX_ATTEMPTS") {
            config.block_max_attempts = parse_number("ESCR_BLOCK_MAX_ATTEMPTS", &value)?;
            if config.block_max_attempts == 0 {
                return Err(ConfigError::Invalid {
                    key: "ESCR_BLOCK_MAX_ATTEMPTS",
                    value,
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if let Some(value) = lookup("ESCR_LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = parse_number("ESCR_LOCK_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("ESCR_CATCHUP_BATCH_SIZE") {
            config.batch_size = parse_number("ESCR_CATCHUP_BATCH_SIZE", &value)?;
        }
        config.worker_program = lookup("ESCR_CATCHUP_WORKER_PROGRAM")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        config.worker_args = lookup("ESCR_CATCHUP_WORKER_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        config.database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());

        Ok(config)
    }

    pub fn block_policy(&self) -> BlockPolicy {
        BlockPolicy {
            poll_interval: Duration::from_millis(self.block_poll_interval_ms),
            max_attempts: self.block_max_attempts,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn catch_up_options(&self) -> CatchUpOptions {
        CatchUpOptions::default().with_batch_size(self.batch_size)
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            message: "expected a boolean".to_string(),
        }),
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: core::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        message: e.to_string(),
    })
}

/// Build the catch-up trigger for `repository_id` as configured.
///
/// `synchronous` and `coalescing` hold the repository directly, so it must be
/// registered already; the other kinds resolve it when they run.
pub fn build_trigger(
    config: &CatchUpConfig,
    registry: &Arc<ContentRepositoryRegistry>,
    repository_id: &ContentRepositoryId,
) -> Result<Arc<dyn ProjectionCatchUpTrigger>, ConfigError> {
    let options = config.catch_up_options();
    let synchronous = || -> Result<Arc<dyn ProjectionCatchUpTrigger>, ConfigError> {
        Ok(Arc::new(
            SynchronousCatchUpTrigger::new(registry.get(repository_id)?).with_options(options.clone()),
        ))
    };

    let trigger: Arc<dyn ProjectionCatchUpTrigger> = match config.trigger {
        TriggerKind::Synchronous => return synchronous(),
        TriggerKind::InProcess => Arc::new(
            RegistryCatchUpTrigger::new(registry.clone(), repository_id.clone()).with_options(options.clone()),
        ),
        TriggerKind::Thread => Arc::new(SpawningCatchUpTrigger::new(
            ThreadSpawner::new(registry.clone()).with_options(options.clone()),
            repository_id.clone(),
        )),
        TriggerKind::Subprocess => {
            let program = config
                .worker_program
                .clone()
                .ok_or(ConfigError::MissingWorkerProgram)?;
            Arc::new(SpawningCatchUpTrigger::new(
                ProcessSpawner::new(program).with_args(config.worker_args.iter().cloned()),
                repository_id.clone(),
            ))
        }
        TriggerKind::Coalescing => Arc::new(
            CoalescingCatchUpTrigger::new(registry.get(repository_id)?).with_options(options.clone()),
        ),
    };

    if !config.synchronous_option {
        return Ok(trigger);
    }
    let with_option = CatchUpTriggerWithSynchronousOption::new(trigger, synchronous()?);
    with_option.enable_synchronous();
    Ok(Arc::new(with_option))
}
