//! Event store configuration loaded from environment variables.

use std::time::Duration;

use common::config::{env_millis, env_or};

/// Tuning for the Postgres backend and its read-ahead cache.
///
/// Reads from environment variables:
/// - `EVENTSTORE_CACHE_SIZE` — events kept in the read-ahead window, 0 disables the cache (default: `10000`)
/// - `EVENTSTORE_BATCH_SIZE` — rows fetched per cache refresh query (default: `1000`)
/// - `EVENTSTORE_POLL_INTERVAL_MS` — fallback poll when notifications are lost (default: `1000`)
/// - `EVENTSTORE_RECONNECT_DELAY_MS` — pause before re-opening the LISTEN connection (default: `5000`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStoreConfig {
    pub cache_size: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
}

impl EventStoreConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_size: env_or("EVENTSTORE_CACHE_SIZE", defaults.cache_size),
            batch_size: env_or("EVENTSTORE_BATCH_SIZE", defaults.batch_size).max(1),
            poll_interval: env_millis("EVENTSTORE_POLL_INTERVAL_MS", defaults.poll_interval),
            reconnect_delay: env_millis("EVENTSTORE_RECONNECT_DELAY_MS", defaults.reconnect_delay),
        }
    }

    /// Whether the read-ahead cache is enabled.
    pub fn cache_enabled(&self) -> bool {
        self.cache_size > 0
    }
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            cache_size: 10_000,
            batch_size: 1000,
            poll_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = EventStoreConfig::default();
        assert_eq!(config.cache_size, 10_000);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.cache_enabled());
    }

    #[test]
    fn test_zero_cache_disables_it() {
        let config = EventStoreConfig {
            cache_size: 0,
            ..Default::default()
        };
        assert!(!config.cache_enabled());
    }
}
