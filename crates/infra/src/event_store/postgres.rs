//! Postgres-backed event store implementation.
//!
//! One table per content repository holds the global log. Each row carries
//! both positions of an event: `sequence_number` in the global log (primary
//! key) and `version` inside its stream.
//!
//! ## Gap-free Commits
//!
//! Postgres sequences may skip values on rollback, so the global position is
//! computed as `MAX(sequence_number) + 1` inside the commit transaction, while
//! a transaction-scoped advisory lock serializes commits to the same table.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Concurrency` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use escr_core::{ContentRepositoryId, EventId, ExpectedVersion, SequenceNumber, StreamName};
use escr_events::{Event, EventEnvelope};

use super::r#trait::{CommitResult, EventStore, EventStoreError, LogRange};
use crate::db::{PgConnector, is_unique_violation, validate_table_name};

/// Postgres-backed append-only event store.
///
/// `PostgresEventStore` is `Send + Sync` and can be shared across threads; all
/// calls block the calling thread on the connector's runtime.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    connector: PgConnector,
    table: String,
}

impl PostgresEventStore {
    pub fn new(connector: PgConnector, table: impl Into<String>) -> Result<Self, EventStoreError> {
        let table = table.into();
        validate_table_name(&table).map_err(EventStoreError::Storage)?;
        Ok(Self { connector, table })
    }

    /// Store using the conventional `cr_<repository>_events` table.
    pub fn for_repository(
        connector: PgConnector,
        repository: &ContentRepositoryId,
    ) -> Result<Self, EventStoreError> {
        Self::new(connector, format!("cr_{}_events", repository.as_str().to_ascii_lowercase()))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn commit_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        stream_name: &StreamName,
        events: &[Event],
        expected_version: ExpectedVersion,
    ) -> Result<CommitResult, EventStoreError> {
        // Serializes commits so that each batch gets a contiguous range.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.table)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("commit_lock", e))?;

        let current: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(version), 0) FROM {} WHERE stream_name = $1",
            self.table
        ))
        .bind(stream_name.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;
        let current = current as u64;

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream '{stream_name}': expected {expected_version:?}, found {current}"
            )));
        }

        let highest: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM {}",
            self.table
        ))
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("highest_sequence_number", e))?;

        let insert = format!(
            r#"
            INSERT INTO {} (
                sequence_number,
                stream_name,
                version,
                event_id,
                event_type,
                payload,
                metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            self.table
        );

        let mut version = current;
        let mut seq = SequenceNumber::new(highest as u64);
        for event in events {
            version += 1;
            seq = seq.next();
            sqlx::query(&insert)
                .bind(seq.value() as i64)
                .bind(stream_name.as_str())
                .bind(version as i64)
                .bind(*event.id().as_uuid())
                .bind(event.event_type())
                .bind(event.payload())
                .bind(JsonValue::Object(event.metadata().clone()))
                .execute(&mut **tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        EventStoreError::Concurrency(format!(
                            "concurrent commit detected at sequence number {seq}"
                        ))
                    } else {
                        map_sqlx_error("insert_event", e)
                    }
                })?;
        }

        Ok(CommitResult {
            highest_committed_version: version,
            highest_committed_sequence_number: seq,
        })
    }
}

impl EventStore for PostgresEventStore {
    #[instrument(skip(self), fields(table = %self.table), err)]
    fn setup(&self) -> Result<(), EventStoreError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                sequence_number BIGINT PRIMARY KEY CHECK (sequence_number > 0),
                stream_name TEXT NOT NULL,
                version BIGINT NOT NULL CHECK (version > 0),
                event_id UUID NOT NULL UNIQUE,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (stream_name, version)
            )
            "#,
            table = self.table
        );

        self.connector.block_on(async {
            sqlx::query(&ddl)
                .execute(self.connector.pool())
                .await
                .map_err(|e| map_sqlx_error("setup", e))?;
            Ok::<(), EventStoreError>(())
        })
    }

    #[instrument(
        skip(self, events),
        fields(
            stream_name = %stream_name,
            event_count = events.len(),
            expected_version = ?expected_version
        ),
        err
    )]
    fn commit(
        &self,
        stream_name: &StreamName,
        events: &[Event],
        expected_version: ExpectedVersion,
    ) -> Result<CommitResult, EventStoreError> {
        self.connector.block_on(async {
            let mut tx = self
                .connector
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;

            match self
                .commit_in_tx(&mut tx, stream_name, events, expected_version)
                .await
            {
                Ok(result) => {
                    tx.commit()
                        .await
                        .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                    Ok::<_, EventStoreError>(result)
                }
                Err(err) => {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    Err(err)
                }
            }
        })
    }

    #[instrument(skip(self), fields(stream_name = %stream_name), err)]
    fn load_stream(&self, stream_name: &StreamName) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE stream_name = $1 ORDER BY version ASC",
            self.table
        );
        self.connector.block_on(async {
            let rows = sqlx::query(&sql)
                .bind(stream_name.as_str())
                .fetch_all(self.connector.pool())
                .await
                .map_err(|e| map_sqlx_error("load_stream", e))?;
            rows.iter().map(envelope_from_row).collect::<Result<Vec<_>, _>>()
        })
    }

    #[instrument(skip(self), fields(after = %range.start_after()), err)]
    fn load_all(&self, range: LogRange) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM {}
            WHERE sequence_number > $1
              AND ($2::BIGINT IS NULL OR sequence_number <= $2)
            ORDER BY sequence_number ASC
            LIMIT $3
            "#,
            self.table
        );
        let up_to = range.upper_bound().map(|s| s.value() as i64);
        let limit = range.max_events().map(|l| l.min(i64::MAX as usize) as i64);

        self.connector.block_on(async {
            let rows = sqlx::query(&sql)
                .bind(range.start_after().value() as i64)
                .bind(up_to)
                .bind(limit)
                .fetch_all(self.connector.pool())
                .await
                .map_err(|e| map_sqlx_error("load_all", e))?;
            rows.iter().map(envelope_from_row).collect::<Result<Vec<_>, _>>()
        })
    }

    fn highest_sequence_number(&self) -> Result<SequenceNumber, EventStoreError> {
        let sql = format!("SELECT COALESCE(MAX(sequence_number), 0) FROM {}", self.table);
        self.connector.block_on(async {
            let highest: i64 = sqlx::query_scalar(&sql)
                .fetch_one(self.connector.pool())
                .await
                .map_err(|e| map_sqlx_error("highest_sequence_number", e))?;
            Ok::<_, EventStoreError>(SequenceNumber::new(highest as u64))
        })
    }
}

const COLUMNS: &str =
    "sequence_number, stream_name, version, event_id, event_type, payload, metadata, recorded_at";

fn envelope_from_row(row: &PgRow) -> Result<EventEnvelope, EventStoreError> {
    let decode = |e: sqlx::Error| EventStoreError::Storage(format!("failed to decode event row: {e}"));

    let sequence_number: i64 = row.try_get("sequence_number").map_err(decode)?;
    let stream_name: String = row.try_get("stream_name").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;
    let event_id: Uuid = row.try_get("event_id").map_err(decode)?;
    let event_type: String = row.try_get("event_type").map_err(decode)?;
    let payload: JsonValue = row.try_get("payload").map_err(decode)?;
    let metadata: JsonValue = row.try_get("metadata").map_err(decode)?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at").map_err(decode)?;

    let stream_name = StreamName::new(stream_name)
        .map_err(|e| EventStoreError::Storage(format!("invalid stream name in log: {e}")))?;

    let metadata = match metadata {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    };
    let event = metadata.into_iter().fold(
        Event::new(EventId::from_uuid(event_id), event_type, payload),
        |event, (key, value)| event.with_metadata(key, value),
    );

    Ok(EventEnvelope::new(
        event,
        stream_name,
        version as u64,
        SequenceNumber::new(sequence_number as u64),
        recorded_at,
    ))
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => EventStoreError::Storage(format!("{operation}: {other}")),
    }
}
