use thiserror::Error;

use crate::{EventStoreToken, EventStoreVersion, Version};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The expected version did not match the stream's current version.
    /// Nothing was written.
    #[error(
        "Concurrency conflict for stream {stream}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        stream: String,
        expected: EventStoreVersion,
        actual: Version,
    },

    /// The append request itself was malformed.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// A token string that is neither empty nor a positive integer.
    #[error("Invalid event store token: {0:?}")]
    InvalidToken(String),

    /// The body of a header-only event was accessed.
    #[error("Body of event {0} was not loaded")]
    BodyNotLoaded(EventStoreToken),

    /// Stored data contradicts an invariant; the operation was aborted.
    #[error("Event store invariant violated: {0}")]
    Invariant(String),

    /// A stream version past what the `INTEGER` version column can hold.
    #[error("Version {version} of stream {stream} does not fit the version column")]
    VersionOverflow { stream: String, version: Version },

    /// A storage failure that invalidated the read-ahead cache.
    /// The request should be retried.
    #[error("Event store storage failure: {0}")]
    Storage(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true for expected-version mismatches.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Returns true for faults worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Database(_))
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
