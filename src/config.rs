//! Runtime configuration: coordination timings and event fan-out capacity.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the coordinator looks for its JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/lobby.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "LOBBY_HANDOFF_CONFIG_PATH";
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Timers driving debounce, settle and grace behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub presence_debounce: Duration,
    /// Wait after an implicit join before re-reading the room.
    pub join_settle: Duration,
    /// Cleanup suppression window opened when a battle start begins.
    pub battle_grace: Duration,
    /// Delay after publication before the host is forced into hand-off.
    pub auto_enter_fallback: Duration,
    pub release_animation: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            presence_debounce: Duration::from_millis(200),
            join_settle: Duration::from_millis(200),
            battle_grace: Duration::from_millis(7000),
            auto_enter_fallback: Duration::from_millis(3000),
            release_animation: Duration::from_millis(1650),
        }
    }
}

/// Immutable runtime configuration shared across sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub timings: Timings,
    /// Capacity of each session's event broadcast channel.
    pub event_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        grace_ms = config.timings.battle_grace.as_millis() as u64,
                        "loaded lobby configuration"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a configuration document; absent keys keep their defaults.
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<RawConfig>(contents).map(Into::into)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
/// JSON representation of the file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde(default)]
    timings: RawTimings,
    event_capacity: Option<usize>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTimings {
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    presence_debounce: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    join_settle: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    battle_grace: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    auto_enter_fallback: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    release_animation: Option<Duration>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = Timings::default();
        let raw = value.timings;
        Self {
            timings: Timings {
                presence_debounce: raw.presence_debounce.unwrap_or(defaults.presence_debounce),
                join_settle: raw.join_settle.unwrap_or(defaults.join_settle),
                battle_grace: raw.battle_grace.unwrap_or(defaults.battle_grace),
                auto_enter_fallback: raw
                    .auto_enter_fallback
                    .unwrap_or(defaults.auto_enter_fallback),
                release_animation: raw.release_animation.unwrap_or(defaults.release_animation),
            },
            event_capacity: value
                .event_capacity
                .filter(|capacity| *capacity > 0)
                .unwrap_or(DEFAULT_EVENT_CAPACITY),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(AppConfig::from_json("{}").unwrap(), AppConfig::default());
    }

    #[test]
    fn partial_timings_override_only_named_fields() {
        let config =
            AppConfig::from_json(r#"{"timings":{"battleGrace":9000},"eventCapacity":16}"#)
                .unwrap();
        assert_eq!(config.timings.battle_grace, Duration::from_secs(9));
        assert_eq!(config.timings.presence_debounce, Duration::from_millis(200));
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn zero_capacity_is_replaced() {
        let config = AppConfig::from_json(r#"{"eventCapacity":0}"#).unwrap();
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn malformed_durations_are_rejected() {
        assert!(AppConfig::from_json(r#"{"timings":{"joinSettle":"soon"}}"#).is_err());
    }
}
