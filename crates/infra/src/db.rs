//! Blocking access to Postgres.
//!
//! The catch-up machinery is synchronous: a worker thread takes a lock, reads
//! a batch, applies it and releases the lock. The Postgres adapters therefore
//! own a small tokio runtime and drive SQLx futures to completion with
//! `block_on`. Never call these adapters from inside another tokio runtime.

use std::future::Future;
use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::runtime::Runtime;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to start database runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("failed to connect to database: {0}")]
    Connect(#[from] sqlx::Error),
}

/// A Postgres pool plus the runtime that drives it.
///
/// Cheap to clone; clones share the pool and the runtime.
#[derive(Debug, Clone)]
pub struct PgConnector {
    runtime: Arc<Runtime>,
    pool: PgPool,
}

impl PgConnector {
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("escr-db")
            .enable_all()
            .build()?;

        let pool = runtime.block_on(
            PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(database_url),
        )?;

        Ok(Self {
            runtime: Arc::new(runtime),
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a future on the connector's runtime and wait for it.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// Whether `err` is a Postgres unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Table names are interpolated into SQL, so only allow plain identifiers.
pub(crate) fn validate_table_name(name: &str) -> Result<(), String> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(format!("invalid table name '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_must_be_plain_identifiers() {
        assert!(validate_table_name("cr_default_events").is_ok());
        assert!(validate_table_name("_checkpoints2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1events").is_err());
        assert!(validate_table_name("events; DROP TABLE x").is_err());
        assert!(validate_table_name("Events").is_err());
    }
}
