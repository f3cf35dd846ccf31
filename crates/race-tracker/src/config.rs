//! Race tracker configuration.
//!
//! | variable                 | default                  |
//! |--------------------------|--------------------------|
//! | `RACETRACKER_REDIS_URL`  | `redis://127.0.0.1:6379` |
//! | `RACETRACKER_STREAM_KEY` | `escr:race-tracker`      |

use serde::{Deserialize, Serialize};

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

pub const DEFAULT_STREAM_KEY: &str = "escr:race-tracker";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceTrackerConfig {
    pub redis_url: String,
    pub stream_key: String,
}

impl Default for RaceTrackerConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
        }
    }
}

impl RaceTrackerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();
        Self {
            redis_url: get("RACETRACKER_REDIS_URL").unwrap_or(defaults.redis_url),
            stream_key: get("RACETRACKER_STREAM_KEY").unwrap_or(defaults.stream_key),
        }
    }
}
