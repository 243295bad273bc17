use std::path::PathBuf;

use crate::limits::DEFAULT_FEED_CAPACITY;

/// Runtime settings, read once from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Prometheus exporter port (`COVOIT_METRICS_PORT`). Disabled if unset.
    pub metrics_port: Option<u16>,
    /// JSON trip list to load (`COVOIT_TRIPS_FILE`). Built-in fixtures if unset.
    pub trips_file: Option<PathBuf>,
    /// Per-channel buffer of the in-memory feed (`COVOIT_FEED_CAPACITY`).
    pub feed_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics_port: None,
            trips_file: None,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            metrics_port: lookup("COVOIT_METRICS_PORT").and_then(|s| s.parse().ok()),
            trips_file: lookup("COVOIT_TRIPS_FILE")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            feed_capacity: lookup("COVOIT_FEED_CAPACITY")
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.feed_capacity),
        }
    }
}
