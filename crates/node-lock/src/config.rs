use std::time::Duration;

use common::config::env_millis;

/// Lock manager configuration.
///
/// Reads from environment variables:
/// - `NODE_LOCK_POLL_INTERVAL_MS` — longest wait between re-checks of a held lock (default: `5000`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub poll_interval: Duration,
}

impl LockConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            poll_interval: env_millis("NODE_LOCK_POLL_INTERVAL_MS", Self::default().poll_interval),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(LockConfig::default().poll_interval, Duration::from_secs(5));
    }
}
