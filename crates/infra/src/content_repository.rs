//! A content repository: one event store, one checkpoint store and the set
//! of projections built from that event store.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use escr_core::{ContentRepositoryId, ProjectionId, SequenceNumber};
use escr_events::{
    ApplyError, CatchUpHook, CatchUpHookFactory, CatchUpHooks, Projection, Projections, ProjectionsError,
};

use crate::catch_up::{CatchUpError, CatchUpOptions, CatchUpReport, ProjectionCatchUp};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::event_store::{EventStore, EventStoreError};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    UnknownProjection(#[from] ProjectionsError),

    #[error("projection '{projection}' failed: {source}")]
    Projection {
        projection: ProjectionId,
        #[source]
        source: ApplyError,
    },
}

pub struct ContentRepository {
    id: ContentRepositoryId,
    event_store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    projections: Projections,
    hook_factories: Vec<(ProjectionId, Arc<dyn CatchUpHookFactory>)>,
}

impl ContentRepository {
    pub fn builder(
        id: ContentRepositoryId,
        event_store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> ContentRepositoryBuilder {
        ContentRepositoryBuilder {
            repository: ContentRepository {
                id,
                event_store,
                checkpoints,
                projections: Projections::new(),
                hook_factories: Vec::new(),
            },
        }
    }

    pub fn id(&self) -> &ContentRepositoryId {
        &self.id
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.event_store
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn projections(&self) -> &Projections {
        &self.projections
    }

    /// Create event store, checkpoint and read model storage. Idempotent.
    #[instrument(skip(self), fields(repository = %self.id), err)]
    pub fn setup(&self) -> Result<(), RepositoryError> {
        self.event_store.setup()?;
        for projection in self.projections.iter() {
            self.checkpoints.setup(projection.id())?;
            projection
                .setup()
                .map_err(|source| RepositoryError::Projection {
                    projection: projection.id().clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Bring `projection` up to date, running its registered hooks.
    pub fn catch_up_projection(
        &self,
        projection: &ProjectionId,
        options: &CatchUpOptions,
    ) -> Result<CatchUpReport, CatchUpError> {
        let target = self.projections.get(projection)?;
        ProjectionCatchUp::new(target.as_ref(), self.event_store.as_ref(), self.checkpoints.as_ref())
            .with_hook(self.build_hooks(projection))
            .with_options(options.clone())
            .run()
    }

    pub fn projection_sequence_number(
        &self,
        projection: &ProjectionId,
    ) -> Result<SequenceNumber, RepositoryError> {
        self.projections.get(projection)?;
        Ok(self.checkpoints.highest_applied_sequence_number(projection)?)
    }

    /// Drop the read model of `projection` and rewind its checkpoint.
    ///
    /// Holds the projection lock while doing so; a running catch-up finishes
    /// its batch first.
    #[instrument(skip(self), fields(repository = %self.id), err)]
    pub fn reset_projection_state(&self, projection: &ProjectionId) -> Result<(), RepositoryError> {
        let target = self.projections.get(projection)?;
        self.checkpoints.acquire_lock(projection)?;
        if let Err(source) = target.reset() {
            self.checkpoints.release_lock(projection)?;
            return Err(RepositoryError::Projection {
                projection: projection.clone(),
                source,
            });
        }
        self.checkpoints.reset_and_release_lock(projection)?;
        info!(projection = %projection, "projection state reset");
        Ok(())
    }

    pub fn reset_projection_states(&self) -> Result<(), RepositoryError> {
        for projection in self.projections.ids() {
            self.reset_projection_state(&projection)?;
        }
        Ok(())
    }

    fn build_hooks(&self, projection: &ProjectionId) -> Box<dyn CatchUpHook> {
        let hooks: CatchUpHooks = self
            .hook_factories
            .iter()
            .filter(|(id, _)| id == projection)
            .map(|(_, factory)| factory.build(projection))
            .collect();
        Box::new(hooks)
    }
}

impl core::fmt::Debug for ContentRepository {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContentRepository")
            .field("id", &self.id)
            .field("projections", &self.projections)
            .field("hook_factories", &self.hook_factories.len())
            .finish_non_exhaustive()
    }
}

pub struct ContentRepositoryBuilder {
    repository: ContentRepository,
}

impl ContentRepositoryBuilder {
    pub fn with_projection(mut self, projection: Arc<dyn Projection>) -> Result<Self, ProjectionsError> {
        self.repository.projections.register(projection)?;
        Ok(self)
    }

    /// Register a hook factory for an already registered projection.
    pub fn with_catch_up_hook_factory(
        mut self,
        projection: &ProjectionId,
        factory: Arc<dyn CatchUpHookFactory>,
    ) -> Result<Self, ProjectionsError> {
        self.repository.projections.get(projection)?;
        self.repository
            .hook_factories
            .push((projection.clone(), factory));
        Ok(self)
    }

    pub fn build(self) -> ContentRepository {
        self.repository
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use escr_core::{EventId, ExpectedVersion, StreamName};
    use escr_events::{Event, EventEnvelope};

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::event_store::InMemoryEventStore;

    struct Counter {
        id: ProjectionId,
        count: Mutex<usize>,
    }

    impl Projection for Counter {
        fn id(&self) -> &ProjectionId {
            &self.id
        }

        fn can_handle(&self, _event: &Event) -> bool {
            true
        }

        fn apply(&self, _envelope: &EventEnvelope) -> Result<(), ApplyError> {
            *self.count.lock().unwrap() += 1;
            Ok(())
        }

        fn reset(&self) -> Result<(), ApplyError> {
            *self.count.lock().unwrap() = 0;
            Ok(())
        }
    }

    struct CountBatches(Arc<Mutex<usize>>);

    impl CatchUpHook for CountBatches {
        fn on_before_batch_completed(&mut self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn pid(name: &str) -> ProjectionId {
        ProjectionId::new(name).unwrap()
    }

    fn repository() -> (ContentRepository, Arc<Counter>, Arc<Mutex<usize>>) {
        let counter = Arc::new(Counter {
            id: pid("graph"),
            count: Mutex::new(0),
        });
        let batches = Arc::new(Mutex::new(0));
        let factory: Arc<dyn CatchUpHookFactory> = {
            let batches = batches.clone();
            Arc::new(move |_: &ProjectionId| Box::new(CountBatches(batches.clone())) as Box<dyn CatchUpHook>)
        };

        let repository = ContentRepository::builder(
            ContentRepositoryId::new("default").unwrap(),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryCheckpointStore::new()),
        )
        .with_projection(counter.clone())
        .unwrap()
        .with_catch_up_hook_factory(&pid("graph"), factory)
        .unwrap()
        .build();

        repository.setup().unwrap();
        (repository, counter, batches)
    }

    fn commit(repository: &ContentRepository, n: usize) {
        let events: Vec<Event> = (0..n)
            .map(|_| Event::new(EventId::new(), "NodeWasCreated", json!({})))
            .collect();
        repository
            .event_store()
            .commit(&StreamName::new("s").unwrap(), &events, ExpectedVersion::Any)
            .unwrap();
    }

    #[test]
    fn catch_up_runs_registered_hooks() {
        let (repository, counter, batches) = repository();
        commit(&repository, 3);

        repository
            .catch_up_projection(&pid("graph"), &CatchUpOptions::default())
            .unwrap();

        assert_eq!(*counter.count.lock().unwrap(), 3);
        assert_eq!(*batches.lock().unwrap(), 1);
        assert_eq!(
            repository.projection_sequence_number(&pid("graph")).unwrap(),
            SequenceNumber::new(3)
        );
    }

    #[test]
    fn hook_factory_requires_a_registered_projection() {
        let builder = ContentRepository::builder(
            ContentRepositoryId::new("default").unwrap(),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryCheckpointStore::new()),
        );
        let factory: Arc<dyn CatchUpHookFactory> =
            Arc::new(|_: &ProjectionId| Box::new(escr_events::NoopCatchUpHook) as Box<dyn CatchUpHook>);
        assert!(matches!(
            builder.with_catch_up_hook_factory(&pid("graph"), factory),
            Err(ProjectionsError::Unknown(_))
        ));
    }

    #[test]
    fn unknown_projection_cannot_be_caught_up() {
        let (repository, _, _) = repository();
        let err = repository
            .catch_up_projection(&pid("missing"), &CatchUpOptions::default())
            .unwrap_err();
        assert!(matches!(err, CatchUpError::UnknownProjection(_)));
    }

    #[test]
    fn reset_rewinds_checkpoint_and_read_model() {
        let (repository, counter, _) = repository();
        commit(&repository, 2);
        repository
            .catch_up_projection(&pid("graph"), &CatchUpOptions::default())
            .unwrap();

        repository.reset_projection_states().unwrap();
        assert_eq!(*counter.count.lock().unwrap(), 0);
        assert!(repository
            .projection_sequence_number(&pid("graph"))
            .unwrap()
            .is_none());

        // Replaying without hooks rebuilds the read model.
        repository
            .catch_up_projection(&pid("graph"), &CatchUpOptions::default().without_hooks())
            .unwrap();
        assert_eq!(*counter.count.lock().unwrap(), 2);
    }
}
