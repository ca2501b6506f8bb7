use common::config::env_or;

/// Projection worker configuration.
///
/// Reads from environment variables:
/// - `PROJECTION_CHECKPOINT_INTERVAL` — events applied between checkpoints (default: `100`)
/// - `PROJECTION_BATCH_SIZE` — events fetched per event store read (default: `500`)
/// - `PROJECTION_REBUILD_LOCK` — take the `rebuild.<projection>` node lock before rebuilding (default: `true`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub checkpoint_interval: usize,
    pub batch_size: usize,
    pub rebuild_lock: bool,
}

impl WorkerConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            checkpoint_interval: env_or(
                "PROJECTION_CHECKPOINT_INTERVAL",
                defaults.checkpoint_interval,
            )
            .max(1),
            batch_size: env_or("PROJECTION_BATCH_SIZE", defaults.batch_size).max(1),
            rebuild_lock: env_or("PROJECTION_REBUILD_LOCK", defaults.rebuild_lock),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 100,
            batch_size: event_streaming::DEFAULT_BATCH_SIZE,
            rebuild_lock: true,
        }
    }
}
