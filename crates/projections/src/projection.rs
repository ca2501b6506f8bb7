//! Core projection traits.

use async_trait::async_trait;
use document_store::DocumentFolder;
use event_store::StoredEvent;
use event_streaming::EventFilter;

use crate::Result;

/// A projection instance applying events to its own storage.
///
/// Events after the last checkpoint are replayed after a crash, so
/// [`handle`](Projection::handle) must be idempotent.
#[async_trait]
pub trait Projection: Send {
    /// Applies a single event.
    ///
    /// An error is logged and the event skipped; it does not stop the worker.
    async fn handle(&mut self, event: &StoredEvent) -> Result<()>;

    /// Writes out anything buffered by `handle`. Called before each checkpoint.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Describes a logical projection and creates instances of it.
pub trait ProjectionDefinition: Send + Sync {
    /// Logical name, shared by every instance.
    fn name(&self) -> &str;

    /// Code version. Compared as a string against stored instance versions.
    fn version(&self) -> &str;

    /// Oldest reader version able to read what this version stores.
    fn minimal_reader_version(&self) -> &str {
        self.version()
    }

    /// Events the projection consumes.
    fn event_filter(&self) -> EventFilter;

    /// Creates a projection writing to `storage`, the instance's own folder.
    fn create(&self, storage: DocumentFolder) -> Box<dyn Projection>;
}
