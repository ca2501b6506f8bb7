//! Versioned document storage: hierarchical folders, conditional saves,
//! secondary index lookups and per-document change watches.

pub mod config;
pub mod document;
pub mod error;
pub mod folder;
pub mod memory;
pub mod postgres;
pub mod watch;

pub use config::DocumentStoreConfig;
pub use document::{Document, DocumentStoreVersion, IndexEntry, NewerDocument};
pub use error::{DocumentStoreError, Result};
pub use folder::{DocumentBackend, DocumentFolder};
pub use memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;
pub use watch::{DocumentWatch, WatchHub};
