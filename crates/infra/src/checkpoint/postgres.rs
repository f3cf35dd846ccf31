//! Postgres-backed checkpoint store.
//!
//! Checkpoints live in a plain table; the lock is a session-level advisory
//! lock keyed by `(hashtext(table), hashtext(projection))`. The session that
//! holds it is a dedicated pool connection parked in this store until the
//! lock is released, so the lock is shared by every process using the same
//! database and disappears with the connection if the holder dies.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use sqlx::pool::PoolConnection;
use sqlx::{Connection, Postgres};
use tracing::{debug, instrument, warn};

use escr_core::{ContentRepositoryId, ProjectionId, SequenceNumber};

use super::{CheckpointError, CheckpointStore, DEFAULT_LOCK_TIMEOUT};
use crate::db::{PgConnector, validate_table_name};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct PostgresCheckpointStore {
    connector: PgConnector,
    table: String,
    lock_timeout: Duration,
    held: Mutex<HashMap<ProjectionId, PoolConnection<Postgres>>>,
}

impl core::fmt::Debug for PostgresCheckpointStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresCheckpointStore")
            .field("table", &self.table)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl PostgresCheckpointStore {
    pub fn new(connector: PgConnector, table: impl Into<String>) -> Result<Self, CheckpointError> {
        let table = table.into();
        validate_table_name(&table).map_err(CheckpointError::Storage)?;
        Ok(Self {
            connector,
            table,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            held: Mutex::new(HashMap::new()),
        })
    }

    /// Store using the conventional `cr_<repository>_checkpoints` table.
    pub fn for_repository(
        connector: PgConnector,
        repository: &ContentRepositoryId,
    ) -> Result<Self, CheckpointError> {
        Self::new(
            connector,
            format!("cr_{}_checkpoints", repository.as_str().to_ascii_lowercase()),
        )
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    fn take_held(&self, projection: &ProjectionId) -> Result<PoolConnection<Postgres>, CheckpointError> {
        self.held
            .lock()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?
            .remove(projection)
            .ok_or_else(|| CheckpointError::NotLocked(projection.clone()))
    }

    async fn read_checkpoint(
        &self,
        conn: &mut PoolConnection<Postgres>,
        projection: &ProjectionId,
    ) -> Result<SequenceNumber, CheckpointError> {
        let applied: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT applied_sequence_number FROM {} WHERE projection_name = $1",
            self.table
        ))
        .bind(projection.as_str())
        .fetch_optional(&mut **conn)
        .await
        .map_err(storage("read_checkpoint"))?;
        Ok(SequenceNumber::new(applied.unwrap_or(0) as u64))
    }

    /// Unlock on `conn`; a connection whose unlock failed is closed so that
    /// Postgres drops the session lock with it.
    async fn unlock(&self, mut conn: PoolConnection<Postgres>, projection: &ProjectionId) -> Result<(), CheckpointError> {
        let unlocked = sqlx::query_scalar::<_, bool>(
            "SELECT pg_advisory_unlock(hashtext($1), hashtext($2))",
        )
        .bind(&self.table)
        .bind(projection.as_str())
        .fetch_one(&mut *conn)
        .await;

        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(projection = %projection, "advisory lock was not held by its session");
                let _ = conn.detach().close().await;
                Err(CheckpointError::NotLocked(projection.clone()))
            }
            Err(e) => {
                let _ = conn.detach().close().await;
                Err(storage("unlock")(e))
            }
        }
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self), fields(table = %self.table), err)]
    fn setup(&self, projection: &ProjectionId) -> Result<(), CheckpointError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                projection_name TEXT PRIMARY KEY,
                applied_sequence_number BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        );
        let insert = format!(
            "INSERT INTO {} (projection_name) VALUES ($1) ON CONFLICT (projection_name) DO NOTHING",
            self.table
        );

        self.connector.block_on(async {
            let pool = self.connector.pool();
            sqlx::query(&ddl)
                .execute(pool)
                .await
                .map_err(storage("create_table"))?;
            sqlx::query(&insert)
                .bind(projection.as_str())
                .execute(pool)
                .await
                .map_err(storage("insert_checkpoint"))?;
            Ok::<(), CheckpointError>(())
        })
    }

    fn highest_applied_sequence_number(
        &self,
        projection: &ProjectionId,
    ) -> Result<SequenceNumber, CheckpointError> {
        self.connector.block_on(async {
            let mut conn = self
                .connector
                .pool()
                .acquire()
                .await
                .map_err(storage("acquire_connection"))?;
            self.read_checkpoint(&mut conn, projection).await
        })
    }

    #[instrument(skip(self), level = "debug", err)]
    fn try_acquire_lock(&self, projection: &ProjectionId) -> Result<SequenceNumber, CheckpointError> {
        let applied = self.connector.block_on(async {
            let mut conn = self
                .connector
                .pool()
                .acquire()
                .await
                .map_err(storage("acquire_connection"))?;

            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1), hashtext($2))")
                .bind(&self.table)
                .bind(projection.as_str())
                .fetch_one(&mut *conn)
                .await
                .map_err(storage("try_advisory_lock"))?;
            if !locked {
                return Err(CheckpointError::AlreadyLocked(projection.clone()));
            }

            match self.read_checkpoint(&mut conn, projection).await {
                Ok(applied) => Ok((conn, applied)),
                Err(err) => {
                    self.unlock(conn, projection).await?;
                    Err(err)
                }
            }
        })?;

        let (conn, applied) = applied;
        self.held
            .lock()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?
            .insert(projection.clone(), conn);
        Ok(applied)
    }

    fn acquire_lock(&self, projection: &ProjectionId) -> Result<SequenceNumber, CheckpointError> {
        let started = Instant::now();
        loop {
            match self.try_acquire_lock(projection) {
                Err(CheckpointError::AlreadyLocked(_)) => {
                    let waited = started.elapsed();
                    if waited >= self.lock_timeout {
                        return Err(CheckpointError::LockTimeout {
                            projection: projection.clone(),
                            waited,
                        });
                    }
                    debug!(projection = %projection, "waiting for projection lock");
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                other => return other,
            }
        }
    }

    #[instrument(skip(self), level = "debug", err)]
    fn update_and_release_lock(
        &self,
        projection: &ProjectionId,
        applied: SequenceNumber,
    ) -> Result<(), CheckpointError> {
        let mut conn = self.take_held(projection)?;
        let sql = format!(
            r#"
            UPDATE {}
            SET applied_sequence_number = $2, updated_at = NOW()
            WHERE projection_name = $1 AND applied_sequence_number <= $2
            "#,
            self.table
        );

        self.connector.block_on(async {
            let updated = sqlx::query(&sql)
                .bind(projection.as_str())
                .bind(applied.value() as i64)
                .execute(&mut *conn)
                .await
                .map(|r| r.rows_affected());

            let outcome = match updated {
                Ok(1) => Ok(()),
                Ok(_) => match self.read_checkpoint(&mut conn, projection).await {
                    Ok(current) => Err(CheckpointError::NonMonotonic {
                        projection: projection.clone(),
                        current,
                        attempted: applied,
                    }),
                    Err(err) => Err(err),
                },
                Err(e) => Err(storage("update_checkpoint")(e)),
            };

            self.unlock(conn, projection).await?;
            outcome
        })
    }

    fn release_lock(&self, projection: &ProjectionId) -> Result<(), CheckpointError> {
        let conn = self.take_held(projection)?;
        self.connector.block_on(self.unlock(conn, projection))
    }

    fn reset_and_release_lock(&self, projection: &ProjectionId) -> Result<(), CheckpointError> {
        let mut conn = self.take_held(projection)?;
        let sql = format!(
            "UPDATE {} SET applied_sequence_number = 0, updated_at = NOW() WHERE projection_name = $1",
            self.table
        );

        self.connector.block_on(async {
            let outcome = sqlx::query(&sql)
                .bind(projection.as_str())
                .execute(&mut *conn)
                .await
                .map(|_| ())
                .map_err(storage("reset_checkpoint"));
            self.unlock(conn, projection).await?;
            outcome
        })
    }
}

fn storage(operation: &'static str) -> impl Fn(sqlx::Error) -> CheckpointError {
    move |e| CheckpointError::Storage(format!("{operation}: {e}"))
}
