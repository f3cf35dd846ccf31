//! Events, projections and catch-up mechanics.
//!
//! Everything in this crate is pure: no storage, no threads, no IO. The
//! infrastructure crate composes these pieces with an event store and a
//! checkpoint store.

pub mod envelope;
pub mod event;
pub mod hook;
pub mod pending;
pub mod projection;

pub use envelope::EventEnvelope;
pub use event::{DomainEvent, Event};
pub use hook::{CatchUpHook, CatchUpHookFactory, CatchUpHooks, NoopCatchUpHook};
pub use pending::{PendingProjections, PendingProjectionsError};
pub use projection::{ApplyError, Projection, Projections, ProjectionsError};
