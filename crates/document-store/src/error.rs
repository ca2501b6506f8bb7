use common::NameError;
use thiserror::Error;

use crate::DocumentStoreVersion;

/// Errors that can occur when interacting with the document store.
#[derive(Debug, Error)]
pub enum DocumentStoreError {
    /// The expected version did not match the document's current version.
    /// Nothing was written.
    #[error("Concurrency conflict for document {key}: expected {expected}, found version {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: DocumentStoreVersion,
        actual: i64,
    },

    /// A folder or document name outside the allowed character set.
    #[error("Invalid name: {0}")]
    InvalidName(#[from] NameError),

    /// A document version past what the `INTEGER` version column can hold.
    #[error("Version {version} of document {key} does not fit the version column")]
    VersionOverflow { key: String, version: i64 },

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

impl DocumentStoreError {
    /// Returns true for expected-version mismatches.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Result type for document store operations.
pub type Result<T> = std::result::Result<T, DocumentStoreError>;
