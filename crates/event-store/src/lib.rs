//! Append-only event storage with per-stream versioning and a global,
//! token-ordered log spanning all streams.
//!
//! Two backends implement [`EventStore`]: [`InMemoryEventStore`] for tests
//! and embedded use, and [`PostgresEventStore`] for shared storage.

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use cache::{EventLoader, ReadAheadCache};
pub use config::EventStoreConfig;
pub use error::{EventStoreError, Result};
pub use event::{EventStoreToken, EventStoreVersion, FORMAT_JSON, NewEvent, StoredEvent, Version};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::{AppendResult, DEFAULT_MAX_COUNT, GlobalQuery, GlobalSlice, StreamSlice};
pub use store::{EventStore, EventStoreExt};
