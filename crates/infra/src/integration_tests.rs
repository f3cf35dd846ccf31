//! Integration tests for the full publish pipeline.
//!
//! Tests: EventsToPublish → EventStore → PendingProjections → Trigger →
//! ProjectionCatchUp → Checkpoint → CommandResult::block
//!
//! Verifies:
//! - Read-your-writes via `block()` with every asynchronous trigger
//! - Concurrent catch-ups of one projection never apply an event twice
//! - The same pipeline against Postgres (ignored unless `DATABASE_URL` is set)

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use escr_core::{ContentRepositoryId, EventId, ExpectedVersion, ProjectionId, SequenceNumber, StreamName};
    use escr_events::{ApplyError, DomainEvent, Event, EventEnvelope, Projection};

    use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore};
    use crate::command_result::BlockPolicy;
    use crate::config::{CatchUpConfig, TriggerKind, build_trigger};
    use crate::content_repository::ContentRepository;
    use crate::db::PgConnector;
    use crate::event_persister::EventPersister;
    use crate::event_store::{EventStore, EventsToPublish, InMemoryEventStore, PostgresEventStore};
    use crate::registry::ContentRepositoryRegistry;
    use crate::trigger::{
        CoalescingCatchUpTrigger, ProjectionCatchUpTrigger, SpawningCatchUpTrigger, ThreadSpawner,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type")]
    enum NodeEvent {
        NodeWasCreated { node: String, title: String },
        NodeWasRenamed { node: String, title: String },
    }

    impl DomainEvent for NodeEvent {
        fn event_type(&self) -> &'static str {
            match self {
                NodeEvent::NodeWasCreated { .. } => "NodeWasCreated",
                NodeEvent::NodeWasRenamed { .. } => "NodeWasRenamed",
            }
        }
    }

    /// node -> title, plus every applied sequence number to detect duplicates.
    #[derive(Default)]
    struct NodeTitles {
        titles: Mutex<HashMap<String, String>>,
        applied: Mutex<Vec<SequenceNumber>>,
    }

    struct NodeTitlesProjection {
        id: ProjectionId,
        state: Arc<NodeTitles>,
    }

    impl Projection for NodeTitlesProjection {
        fn id(&self) -> &ProjectionId {
            &self.id
        }

        fn can_handle(&self, event: &Event) -> bool {
            matches!(event.event_type(), "NodeWasCreated" | "NodeWasRenamed")
        }

        fn apply(&self, envelope: &EventEnvelope) -> Result<(), ApplyError> {
            let event: NodeEvent = envelope
                .event()
                .decode()
                .map_err(|e| ApplyError::decode(envelope.event(), e))?;
            let mut titles = self.state.titles.lock().unwrap();
            match event {
                NodeEvent::NodeWasCreated { node, title } => {
                    titles.insert(node, title);
                }
                NodeEvent::NodeWasRenamed { node, title } => {
                    let slot = titles
                        .get_mut(&node)
                        .ok_or_else(|| ApplyError::rejected(format!("unknown node {node}")))?;
                    *slot = title;
                }
            }
            self.state.applied.lock().unwrap().push(envelope.sequence_number());
            Ok(())
        }

        fn reset(&self) -> Result<(), ApplyError> {
            self.state.titles.lock().unwrap().clear();
            self.state.applied.lock().unwrap().clear();
            Ok(())
        }
    }

    fn repository_id() -> ContentRepositoryId {
        ContentRepositoryId::new("default").unwrap()
    }

    fn titles_projection() -> ProjectionId {
        ProjectionId::new("node_titles").unwrap()
    }

    fn build(
        event_store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> (Arc<ContentRepositoryRegistry>, Arc<ContentRepository>, Arc<NodeTitles>) {
        let state = Arc::new(NodeTitles::default());
        let repository = Arc::new(
            ContentRepository::builder(repository_id(), event_store, checkpoints)
                .with_projection(Arc::new(NodeTitlesProjection {
                    id: titles_projection(),
                    state: state.clone(),
                }))
                .unwrap()
                .build(),
        );
        repository.setup().unwrap();
        let registry = Arc::new(ContentRepositoryRegistry::new());
        registry.register(repository.clone()).unwrap();
        (registry, repository, state)
    }

    fn in_memory() -> (Arc<ContentRepositoryRegistry>, Arc<ContentRepository>, Arc<NodeTitles>) {
        build(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryCheckpointStore::new()),
        )
    }

    fn publish(stream: &str, events: &[NodeEvent], expected: ExpectedVersion) -> EventsToPublish {
        EventsToPublish::new(
            StreamName::new(stream).unwrap(),
            events
                .iter()
                .map(|e| Event::from_typed(EventId::new(), e).unwrap())
                .collect(),
            expected,
        )
    }

    fn created(node: &str, title: &str) -> NodeEvent {
        NodeEvent::NodeWasCreated {
            node: node.into(),
            title: title.into(),
        }
    }

    fn renamed(node: &str, title: &str) -> NodeEvent {
        NodeEvent::NodeWasRenamed {
            node: node.into(),
            title: title.into(),
        }
    }

    fn patient() -> BlockPolicy {
        BlockPolicy {
            poll_interval: Duration::from_millis(10),
            max_attempts: 500,
        }
    }

    fn read_your_writes(trigger: Arc<dyn ProjectionCatchUpTrigger>, repository: Arc<ContentRepository>, state: Arc<NodeTitles>) {
        let persister = EventPersister::new(repository, trigger).with_block_policy(patient());

        persister
            .publish_events(publish("node-a", &[created("a", "Home")], ExpectedVersion::NoStream))
            .unwrap()
            .block()
            .unwrap();
        assert_eq!(state.titles.lock().unwrap().get("a").map(String::as_str), Some("Home"));

        persister
            .publish_events(publish("node-a", &[renamed("a", "Start")], ExpectedVersion::Exact(1)))
            .unwrap()
            .block()
            .unwrap();
        assert_eq!(state.titles.lock().unwrap().get("a").map(String::as_str), Some("Start"));
    }

    #[test]
    fn read_your_writes_with_thread_spawner() {
        let (registry, repository, state) = in_memory();
        let trigger = Arc::new(SpawningCatchUpTrigger::new(ThreadSpawner::new(registry), repository_id()));
        read_your_writes(trigger, repository, state);
    }

    #[test]
    fn read_your_writes_with_coalescing_trigger() {
        let (_, repository, state) = in_memory();
        let trigger = Arc::new(CoalescingCatchUpTrigger::new(repository.clone()));
        read_your_writes(trigger, repository, state);
    }

    #[test]
    fn read_your_writes_with_configured_in_process_trigger() {
        let (registry, repository, state) = in_memory();
        let config = CatchUpConfig::from_lookup(|key| {
            (key == "ESCR_CATCHUP_TRIGGER").then(|| "in-process".to_string())
        })
        .unwrap();
        assert_eq!(config.trigger, TriggerKind::InProcess);
        let trigger = build_trigger(&config, &registry, &repository_id()).unwrap();
        read_your_writes(trigger, repository, state);
    }

    #[test]
    fn concurrent_commands_apply_every_event_exactly_once() {
        let (registry, repository, state) = in_memory();
        let trigger = Arc::new(SpawningCatchUpTrigger::new(
            ThreadSpawner::new(registry),
            repository_id(),
        ));
        let persister = Arc::new(EventPersister::new(repository.clone(), trigger).with_block_policy(patient()));

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let persister = persister.clone();
                thread::spawn(move || {
                    let stream = format!("node-{w}");
                    let node = format!("n{w}");
                    for version in 0..5u64 {
                        let event = if version == 0 {
                            created(&node, "v0")
                        } else {
                            renamed(&node, &format!("v{version}"))
                        };
                        let expected = if version == 0 {
                            ExpectedVersion::NoStream
                        } else {
                            ExpectedVersion::Exact(version)
                        };
                        persister
                            .publish_events(publish(&stream, &[event], expected))
                            .unwrap()
                            .block()
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let applied = state.applied.lock().unwrap().clone();
        let mut sorted = applied.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(applied.len(), 40, "some events were applied more than once");
        assert_eq!(sorted.len(), 40);
        assert_eq!(applied, sorted, "events were applied out of order");
        assert_eq!(
            repository.projection_sequence_number(&titles_projection()).unwrap(),
            SequenceNumber::new(40)
        );
        let titles = state.titles.lock().unwrap();
        assert!(titles.values().all(|t| t == "v4"));
    }

    #[test]
    fn failed_apply_is_retried_by_the_next_catch_up() {
        let (registry, repository, state) = in_memory();
        let trigger = Arc::new(SpawningCatchUpTrigger::new(ThreadSpawner::new(registry), repository_id()));
        let persister = EventPersister::new(repository.clone(), trigger).with_block_policy(BlockPolicy {
            poll_interval: Duration::from_millis(5),
            max_attempts: 20,
        });

        // Renaming an unknown node is rejected by the projection.
        let result = persister
            .publish_events(publish("node-x", &[renamed("x", "Nope")], ExpectedVersion::NoStream))
            .unwrap();
        assert!(result.block().is_err());
        assert!(state.applied.lock().unwrap().is_empty());
        assert!(repository
            .projection_sequence_number(&titles_projection())
            .unwrap()
            .is_none());
    }

    fn postgres() -> Option<PgConnector> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(PgConnector::connect(&url, 8).expect("failed to connect to DATABASE_URL"))
    }

    #[test]
    #[ignore = "requires DATABASE_URL"]
    fn postgres_pipeline_read_your_writes() {
        let Some(connector) = postgres() else { return };
        let suffix = uuid::Uuid::now_v7().simple().to_string();
        let event_store = PostgresEventStore::new(connector.clone(), format!("it_events_{suffix}")).unwrap();
        let checkpoints = PostgresCheckpointStore::new(connector, format!("it_checkpoints_{suffix}"))
            .unwrap()
            .with_lock_timeout(Duration::from_secs(10));

        let (registry, repository, state) = build(Arc::new(event_store), Arc::new(checkpoints));
        let trigger = Arc::new(SpawningCatchUpTrigger::new(ThreadSpawner::new(registry), repository_id()));
        read_your_writes(trigger, repository.clone(), state.clone());

        repository.reset_projection_states().unwrap();
        assert!(state.titles.lock().unwrap().is_empty());
        repository
            .catch_up_projection(&titles_projection(), &Default::default())
            .unwrap();
        assert_eq!(state.titles.lock().unwrap().get("a").map(String::as_str), Some("Start"));
    }

    #[test]
    #[ignore = "requires DATABASE_URL"]
    fn postgres_projection_lock_is_exclusive_across_stores() {
        let Some(connector) = postgres() else { return };
        let table = format!("it_checkpoints_{}", uuid::Uuid::now_v7().simple());
        let first = PostgresCheckpointStore::new(connector.clone(), table.clone()).unwrap();
        let second = PostgresCheckpointStore::new(connector, table)
            .unwrap()
            .with_lock_timeout(Duration::from_millis(100));
        let projection = titles_projection();
        first.setup(&projection).unwrap();

        first.acquire_lock(&projection).unwrap();
        assert!(second.try_acquire_lock(&projection).is_err());
        assert!(second.acquire_lock(&projection).is_err());

        first
            .update_and_release_lock(&projection, SequenceNumber::new(3))
            .unwrap();
        assert_eq!(second.acquire_lock(&projection).unwrap(), SequenceNumber::new(3));
        assert!(second
            .update_and_release_lock(&projection, SequenceNumber::new(2))
            .is_err());
        assert_eq!(
            first.highest_applied_sequence_number(&projection).unwrap(),
            SequenceNumber::new(3)
        );
    }
}
