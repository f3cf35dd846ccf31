use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use escr_core::EventId;

/// A typed domain event produced by a command handler.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - designed to be **append-only**
/// - identified by a stable type name used for routing (`can_handle`)
pub trait DomainEvent: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "NodeAggregateWasMoved").
    fn event_type(&self) -> &'static str;
}

/// A domain-agnostic event as it is committed to, and loaded from, the event store.
///
/// The payload is kept as JSON so that projections of different shapes can be
/// registered side by side; use [`Event::decode`] to get the typed event back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    event_type: String,
    payload: JsonValue,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, JsonValue>,
}

impl Event {
    pub fn new(id: EventId, event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            payload,
            metadata: Map::new(),
        }
    }

    /// Serialize a typed domain event.
    pub fn from_typed<E>(id: EventId, event: &E) -> Result<Self, serde_json::Error>
    where
        E: DomainEvent + Serialize,
    {
        Ok(Self::new(id, event.event_type(), serde_json::to_value(event)?))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn metadata(&self) -> &Map<String, JsonValue> {
        &self.metadata
    }

    /// Deserialize the payload into a typed event.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct NodeWasMoved {
        node: String,
        new_parent: String,
    }

    impl DomainEvent for NodeWasMoved {
        fn event_type(&self) -> &'static str {
            "NodeWasMoved"
        }
    }

    #[test]
    fn typed_events_round_trip_through_the_json_payload() {
        let typed = NodeWasMoved {
            node: "a".into(),
            new_parent: "b".into(),
        };
        let event = Event::from_typed(EventId::new(), &typed).unwrap();

        assert_eq!(event.event_type(), "NodeWasMoved");
        assert_eq!(event.decode::<NodeWasMoved>().unwrap(), typed);
    }

    #[test]
    fn metadata_is_omitted_when_empty() {
        let event = Event::new(EventId::new(), "X", serde_json::json!({}));
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("metadata").is_none());

        let event = event.with_metadata("initiatingUserId", serde_json::json!("u1"));
        assert_eq!(event.metadata()["initiatingUserId"], "u1");
    }
}
