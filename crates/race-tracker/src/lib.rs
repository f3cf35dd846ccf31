//! Race tracker: verifies that a projection never catches up concurrently
//! with itself.
//!
//! Catch-up workers trace two things into one shared, totally ordered log
//! through [`RaceTrackerCatchUpHook`]: entering the critical section for an
//! event, and being about to release the projection lock. After the run,
//! [`TraceEntries::verify`] walks the log and reports overlapping critical
//! sections and events applied more than once.
//!
//! Workers in one process can share an [`InMemoryTraceLog`]; workers in
//! separate processes need the Redis Streams log (`redis` feature).

pub mod analysis;
pub mod config;
pub mod hook;
pub mod log;
#[cfg(feature = "redis")]
pub mod redis_log;
pub mod trace;
pub mod tracker;

pub use analysis::{ConcurrencyViolation, DuplicateProcessing, RaceReport, TraceEntries};
pub use config::RaceTrackerConfig;
pub use hook::{RaceTrackerCatchUpHook, RaceTrackerHookFactory};
pub use log::{InMemoryTraceLog, TraceLog, TraceLogError};
#[cfg(feature = "redis")]
pub use redis_log::RedisTraceLog;
pub use trace::{LogPosition, TraceEntry, TraceEntryType, TracePayload, WorkerId};
pub use tracker::RaceTracker;
