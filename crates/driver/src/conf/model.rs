//! Model — DriverConfig, MultilineConfig and related types.

use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Process-wide tunables. Per-container settings live in [`super::LogOptions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// How often a sender drains its in-memory batch.
    #[serde(with = "duration_str")]
    pub drain_timeout: Duration,
    /// Capacity of each pipeline's bounded send queue.
    pub channel_size: usize,
    /// Filesystem usage percentage above which failed batches are dropped instead of spooled.
    pub disk_threshold: u8,
    /// Byte cap for a reassembled partial record.
    pub max_msg_buffer_size: usize,
    /// Age after which an incomplete partial record is flushed anyway.
    #[serde(with = "duration_str")]
    pub partial_timeout: Duration,
    /// Interval of the stale-buffer sweep.
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    pub socket_path: String,
    pub log_root: String,
    /// Stopped containers whose local store stays readable; the oldest are forgotten first.
    pub retained_stores: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            channel_size: 5_000,
            disk_threshold: 70,
            max_msg_buffer_size: 1_000_000,
            partial_timeout: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(1),
            socket_path: "/run/docker/plugins/logzio.sock".to_string(),
            log_root: "/var/log/docker".to_string(),
            retained_stores: 1024,
        }
    }
}

/// How a line that matches the multiline pattern relates to its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// A matching line continues the event started by a previous line.
    After,
    /// A matching line starts a new event.
    Before,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::After => "after",
            MatchMode::Before => "before",
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "after" => Ok(MatchMode::After),
            "before" => Ok(MatchMode::Before),
            other => Err(format!("match must be 'after' or 'before', got '{}'", other)),
        }
    }
}

/// Multiline grouping settings for one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultilineConfig {
    pub mode: MatchMode,
    pub pattern: String,
    pub negate: bool,
    pub flush_pattern: Option<String>,
    pub separator: String,
    pub max_lines: usize,
    pub max_bytes: usize,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl MultilineConfig {
    pub const DEFAULT_MAX_LINES: usize = 500;
    pub const DEFAULT_MAX_BYTES: usize = 400_000;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_SEPARATOR: &'static str = "\n";

    /// Config with defaults for everything but the pattern.
    pub fn with_pattern(pattern: impl Into<String>) -> Self {
        Self {
            mode: MatchMode::After,
            pattern: pattern.into(),
            negate: false,
            flush_pattern: None,
            separator: Self::DEFAULT_SEPARATOR.to_string(),
            max_lines: Self::DEFAULT_MAX_LINES,
            max_bytes: Self::DEFAULT_MAX_BYTES,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Serde adapter for human-readable durations ("5s", "500ms").
pub(crate) mod duration_str {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_config_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert_eq!(config.channel_size, 5_000);
        assert_eq!(config.disk_threshold, 70);
        assert_eq!(config.partial_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_match_mode_parse() {
        assert_eq!("after".parse::<MatchMode>().unwrap(), MatchMode::After);
        assert_eq!("before".parse::<MatchMode>().unwrap(), MatchMode::Before);
        assert!("sideways".parse::<MatchMode>().is_err());
        assert!("After".parse::<MatchMode>().is_err());
    }

    #[test]
    fn test_durations_round_trip_through_toml() {
        let config = DriverConfig {
            partial_timeout: Duration::from_millis(750),
            ..DriverConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("750ms"));
        let back: DriverConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.partial_timeout, Duration::from_millis(750));
    }
}
