//! Redis Streams-backed trace log.
//!
//! A single stream holds the trace of a test run. Redis executes commands one
//! at a time, so `XADD`s from any number of worker processes land in one total
//! order, and the stream ids it assigns are the log positions.
//!
//! - **Append**: `XADD <stream> * pid .. type .. projection .. [evt .. seq .. id ..]`
//! - **Read**: `XRANGE <stream> - +` (in pages of [`PAGE_SIZE`])
//! - **Reset**: `DEL <stream>`

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, instrument};

use crate::config::RaceTrackerConfig;
use crate::log::{TraceLog, TraceLogError};
use crate::trace::{LogPosition, TraceEntry, TraceEntryType, TracePayload, WorkerId};

/// Entries fetched per `XRANGE` call.
const PAGE_SIZE: usize = 1000;

pub struct RedisTraceLog {
    connection: Mutex<redis::Connection>,
    stream_key: String,
}

impl RedisTraceLog {
    /// Open a connection to the configured Redis server.
    pub fn connect(config: &RaceTrackerConfig) -> Result<Self, TraceLogError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| TraceLogError::Connection(e.to_string()))?;
        let connection = client
            .get_connection()
            .map_err(|e| TraceLogError::Connection(e.to_string()))?;

        debug!(stream_key = %config.stream_key, "connected race tracker to redis");
        Ok(Self {
            connection: Mutex::new(connection),
            stream_key: config.stream_key.clone(),
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> Result<T, TraceLogError>,
    ) -> Result<T, TraceLogError> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| TraceLogError::Connection("redis connection poisoned".to_string()))?;
        f(&mut connection)
    }
}

impl core::fmt::Debug for RedisTraceLog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisTraceLog")
            .field("stream_key", &self.stream_key)
            .finish_non_exhaustive()
    }
}

fn entry_from_stream_id(entry: &redis::streams::StreamId) -> Result<TraceEntry, TraceLogError> {
    let position = LogPosition::new(entry.id.clone());
    let fields = entry
        .map
        .iter()
        .map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .map(|value| (key.clone(), value))
                .map_err(|e| TraceLogError::Malformed {
                    position: position.clone(),
                    message: format!("field '{key}': {e}"),
                })
        })
        .collect::<Result<HashMap<_, _>, _>>()?;
    TraceEntry::from_fields(position, &fields)
}

impl TraceLog for RedisTraceLog {
    #[instrument(skip(self, payload), fields(stream_key = %self.stream_key, projection = %payload.projection), err)]
    fn append(
        &self,
        worker: &WorkerId,
        entry_type: TraceEntryType,
        payload: &TracePayload,
    ) -> Result<LogPosition, TraceLogError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key).arg("*");
        for (field, value) in TraceEntry::fields(worker, entry_type, payload) {
            cmd.arg(field).arg(value);
        }

        self.with_connection(|conn| {
            cmd.query::<String>(conn)
                .map(LogPosition::new)
                .map_err(|e| TraceLogError::Command(format!("XADD failed: {e}")))
        })
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    fn entries(&self) -> Result<Vec<TraceEntry>, TraceLogError> {
        self.with_connection(|conn| {
            let mut entries = Vec::new();
            let mut start = "-".to_string();
            loop {
                let reply: redis::streams::StreamRangeReply = redis::cmd("XRANGE")
                    .arg(&self.stream_key)
                    .arg(&start)
                    .arg("+")
                    .arg("COUNT")
                    .arg(PAGE_SIZE)
                    .query(conn)
                    .map_err(|e| TraceLogError::Command(format!("XRANGE failed: {e}")))?;

                let page = reply.ids.len();
                for id in &reply.ids {
                    entries.push(entry_from_stream_id(id)?);
                }
                match reply.ids.last() {
                    // Exclusive start: continue after the last id seen.
                    Some(last) if page == PAGE_SIZE => start = format!("({}", last.id),
                    _ => break,
                }
            }
            debug!(count = entries.len(), "read trace entries");
            Ok(entries)
        })
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    fn clear(&self) -> Result<(), TraceLogError> {
        self.with_connection(|conn| {
            redis::cmd("DEL")
                .arg(&self.stream_key)
                .query::<i64>(conn)
                .map(|_| ())
                .map_err(|e| TraceLogError::Command(format!("DEL failed: {e}")))
        })
    }
}
