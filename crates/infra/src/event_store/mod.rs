//! Append-only event store boundary.
//!
//! Streams give per-stream optimistic concurrency; the global log gives
//! every committed event a gap-free [`escr_core::SequenceNumber`] that
//! projections and checkpoints are expressed in.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{CommitResult, EventStore, EventStoreError, EventsToPublish, LogRange};
