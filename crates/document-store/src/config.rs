//! Document store configuration loaded from environment variables.

use std::time::Duration;

use common::config::env_millis;

/// Change-watch tuning for the Postgres backend.
///
/// Reads from environment variables:
/// - `DOCUMENTS_POLL_INTERVAL_MS` — re-check of watched documents (default: `1000`)
/// - `DOCUMENTS_RECONNECT_DELAY_MS` — pause before re-opening the LISTEN connection (default: `5000`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentStoreConfig {
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
}

impl DocumentStoreConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_millis("DOCUMENTS_POLL_INTERVAL_MS", defaults.poll_interval),
            reconnect_delay: env_millis("DOCUMENTS_RECONNECT_DELAY_MS", defaults.reconnect_delay),
        }
    }
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
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
        let config = DocumentStoreConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
    }
}
