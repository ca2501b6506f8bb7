use document_store::DocumentStoreError;
use thiserror::Error;

/// Errors that can occur when taking or releasing node locks.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock document could not be read or written.
    #[error("Lock storage error: {0}")]
    Document(#[from] DocumentStoreError),
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
