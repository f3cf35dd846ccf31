use std::sync::Arc;

use thiserror::Error;

use escr_core::ProjectionId;

use crate::{Event, EventEnvelope};

/// A projection builds a read model from the global event log.
///
/// Projections are **selective**: [`Projection::can_handle`] tells the catch-up
/// machinery (and the pending-projections calculator) which events matter to
/// this projection. Events a projection cannot handle still advance its
/// checkpoint during catch-up, but never reach [`Projection::apply`].
///
/// ## Progress
///
/// A projection does not track its own position. The highest applied
/// sequence number lives in the checkpoint store, keyed by
/// [`Projection::id`], and is only advanced while the projection's lock is
/// held. This is what guarantees that a projection never runs concurrently
/// with itself.
///
/// ## Shared access
///
/// Projections are registered as `Arc<dyn Projection>` and read concurrently
/// by queries while a catch-up worker applies events, so all methods take
/// `&self`; implementations use interior mutability for their read model.
///
/// ## Errors
///
/// An `Err` from [`Projection::apply`] halts catch-up at that event. The
/// checkpoint is not advanced past it and the next catch-up retries it, so
/// `apply` must be safe to retry for an event that previously failed.
pub trait Projection: Send + Sync {
    /// Stable identity, used as the checkpoint key.
    fn id(&self) -> &ProjectionId;

    /// Whether this projection is interested in `event`.
    ///
    /// Must be a pure function of the event.
    fn can_handle(&self, event: &Event) -> bool;

    /// Apply a single event to the read model.
    fn apply(&self, envelope: &EventEnvelope) -> Result<(), ApplyError>;

    /// Prepare the read model storage (idempotent).
    fn setup(&self) -> Result<(), ApplyError> {
        Ok(())
    }

    /// Drop all read model state so the projection can be rebuilt from the log.
    fn reset(&self) -> Result<(), ApplyError>;
}

impl<P> Projection for Arc<P>
where
    P: Projection + ?Sized,
{
    fn id(&self) -> &ProjectionId {
        (**self).id()
    }

    fn can_handle(&self, event: &Event) -> bool {
        (**self).can_handle(event)
    }

    fn apply(&self, envelope: &EventEnvelope) -> Result<(), ApplyError> {
        (**self).apply(envelope)
    }

    fn setup(&self) -> Result<(), ApplyError> {
        (**self).setup()
    }

    fn reset(&self) -> Result<(), ApplyError> {
        (**self).reset()
    }
}

/// Failure while applying an event to a read model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("failed to decode '{event_type}' payload: {message}")]
    Decode { event_type: String, message: String },

    #[error("event rejected by projection: {0}")]
    Rejected(String),

    #[error("read model storage failed: {0}")]
    Storage(String),
}

impl ApplyError {
    pub fn decode(event: &Event, err: impl core::fmt::Display) -> Self {
        Self::Decode {
            event_type: event.event_type().to_string(),
            message: err.to_string(),
        }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionsError {
    #[error("projection '{0}' is already registered")]
    Duplicate(ProjectionId),

    #[error("projection '{0}' is not registered")]
    Unknown(ProjectionId),
}

/// The set of projections of one content repository, in registration order.
#[derive(Clone, Default)]
pub struct Projections {
    projections: Vec<Arc<dyn Projection>>,
}

impl Projections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, projection: Arc<dyn Projection>) -> Result<(), ProjectionsError> {
        if self.contains(projection.id()) {
            return Err(ProjectionsError::Duplicate(projection.id().clone()));
        }
        self.projections.push(projection);
        Ok(())
    }

    pub fn with(mut self, projection: Arc<dyn Projection>) -> Result<Self, ProjectionsError> {
        self.register(projection)?;
        Ok(self)
    }

    pub fn get(&self, id: &ProjectionId) -> Result<&Arc<dyn Projection>, ProjectionsError> {
        self.projections
            .iter()
            .find(|p| p.id() == id)
            .ok_or_else(|| ProjectionsError::Unknown(id.clone()))
    }

    pub fn contains(&self, id: &ProjectionId) -> bool {
        self.projections.iter().any(|p| p.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Projection>> {
        self.projections.iter()
    }

    pub fn ids(&self) -> Vec<ProjectionId> {
        self.projections.iter().map(|p| p.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }
}

impl core::fmt::Debug for Projections {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.projections.iter().map(|p| p.id())).finish()
    }
}
