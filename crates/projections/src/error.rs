//! Projection error types.

use thiserror::Error;

use crate::ProjectionStatus;

/// Errors that can occur while running or reading projections.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// Projection storage or metadata could not be read or written.
    #[error("Document store error: {0}")]
    DocumentStore(#[from] document_store::DocumentStoreError),

    /// The rebuild lock could not be taken or released.
    #[error("Lock error: {0}")]
    Lock(#[from] node_lock::LockError),

    /// Failed to (de)serialize an event payload or a metadata document.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// No instance with this name exists in the projection's metadata.
    #[error("Projection instance not found: {0}")]
    InstanceNotFound(String),

    /// No instance of the projection can be served by any reader.
    #[error("No readable instance available for projection {0}")]
    NoInstanceAvailable(String),

    /// The metadata document kept changing underneath every retry.
    #[error("Metadata of projection {projection} still contended after {attempts} attempts")]
    MetadataContention { projection: String, attempts: usize },

    /// The requested status transition is not allowed from the current status.
    #[error("Instance {instance} is {status} and cannot be upgraded")]
    InvalidTransition {
        instance: String,
        status: ProjectionStatus,
    },

    /// A projection-specific error.
    #[error("Projection error: {0}")]
    Projection(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
