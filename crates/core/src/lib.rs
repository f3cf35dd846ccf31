//! `escr-core`: primitives shared by the event store, projections and catch-up.
//!
//! This crate contains **pure** value types (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod sequence;
pub mod version;

pub use error::{CoreError, CoreResult};
pub use id::{ContentRepositoryId, EventId, ProjectionId, StreamName};
pub use sequence::SequenceNumber;
pub use version::ExpectedVersion;
