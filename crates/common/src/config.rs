//! Environment-variable configuration helpers.

use std::str::FromStr;
use std::time::Duration;

/// Reads and parses `key`, falling back to `default` when unset or invalid.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Reads a millisecond duration from `key`, falling back to `default`.
pub fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
