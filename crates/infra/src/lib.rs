//! Infrastructure layer: event and checkpoint stores, projection catch-up,
//! catch-up triggers and read-your-writes blocking.

pub mod catch_up;
pub mod checkpoint;
pub mod command_result;
pub mod config;
pub mod content_repository;
pub mod db;
pub mod event_persister;
pub mod event_store;
pub mod registry;
pub mod trigger;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use catch_up::{CatchUpError, CatchUpOptions, CatchUpReport, CatchUpState, ProjectionCatchUp};
pub use checkpoint::{CheckpointError, CheckpointStore};
pub use command_result::{BlockError, BlockPolicy, CommandResult};
pub use config::{CatchUpConfig, ConfigError, TriggerKind};
pub use content_repository::{ContentRepository, ContentRepositoryBuilder, RepositoryError};
pub use db::{DbError, PgConnector};
pub use event_persister::{EventPersister, PersistError};
pub use event_store::{CommitResult, EventStore, EventStoreError, EventsToPublish, LogRange};
pub use registry::{ContentRepositoryRegistry, RegistryError};
pub use trigger::{ProjectionCatchUpTrigger, TriggerError};
pub use worker::{WorkerArgs, WorkerError};
