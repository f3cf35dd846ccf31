//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of a single committed event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for EventId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s).map_err(|e| CoreError::invalid_id(format!("EventId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Identifiers that are stable, human-chosen names.
///
/// Names are validated on construction: non-empty, no surrounding whitespace,
/// no control characters (they end up in lock keys, table rows and process
/// arguments).
macro_rules! impl_name_newtype {
    ($t:ident, $name:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $t(String);

        impl $t {
            pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(CoreError::invalid_id(format!("{}: must not be empty", $name)));
                }
                if value.trim() != value {
                    return Err(CoreError::invalid_id(format!(
                        "{}: must not have surrounding whitespace ({value:?})",
                        $name
                    )));
                }
                if value.chars().any(char::is_control) {
                    return Err(CoreError::invalid_id(format!(
                        "{}: must not contain control characters ({value:?})",
                        $name
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_name_newtype!(ProjectionId, "ProjectionId");
impl_name_newtype!(StreamName, "StreamName");
impl_name_newtype!(ContentRepositoryId, "ContentRepositoryId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_id_rejects_blank_and_padded_names() {
        assert!(ProjectionId::new("").is_err());
        assert!(ProjectionId::new(" graph").is_err());
        assert!(ProjectionId::new("gra\nph").is_err());
        assert_eq!(ProjectionId::new("content_graph").unwrap().as_str(), "content_graph");
    }

    #[test]
    fn name_ids_round_trip_through_serde_with_validation() {
        let id: StreamName = serde_json::from_str("\"ContentStream:abc\"").unwrap();
        assert_eq!(id.as_str(), "ContentStream:abc");
        assert!(serde_json::from_str::<StreamName>("\"\"").is_err());
    }

    #[test]
    fn event_id_parses_from_uuid_string() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<EventId>().is_err());
    }
}
