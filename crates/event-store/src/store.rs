use async_trait::async_trait;

use crate::{
    AppendResult, EventStoreError, EventStoreToken, EventStoreVersion, GlobalQuery, GlobalSlice,
    NewEvent, Result, StoredEvent, StreamSlice, Version,
};

/// Core trait for event store implementations.
///
/// An event store keeps one append-only, versioned log per stream plus a
/// single global position space (tokens) spanning all streams.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to a stream.
    ///
    /// Events are appended atomically - either all succeed or none do. The
    /// append fails with `ConcurrencyConflict` if the stream's current
    /// version doesn't satisfy `expected`. Tokens assigned to the batch are
    /// strictly increasing and greater than every token handed out before
    /// the call started.
    async fn append_to_stream(
        &self,
        stream: &str,
        events: Vec<NewEvent>,
        expected: EventStoreVersion,
    ) -> Result<AppendResult>;

    /// Reads up to `max_count` events of a stream starting at `min_version`.
    ///
    /// Events are returned in version order (oldest first).
    async fn read_stream(
        &self,
        stream: &str,
        min_version: Version,
        max_count: usize,
        load_body: bool,
    ) -> Result<StreamSlice>;

    /// Reads the global log after `query.token`, applying the query's filters.
    async fn read_global(&self, query: GlobalQuery) -> Result<GlobalSlice>;

    /// Like [`read_global`](Self::read_global) but suspends until at least
    /// one matching event exists.
    ///
    /// Dropping the returned future cancels the wait.
    async fn wait_for_global(&self, query: GlobalQuery) -> Result<GlobalSlice>;

    /// Fills in the bodies of header-only events.
    async fn load_bodies(&self, events: &mut [StoredEvent]) -> Result<()>;

    /// Returns the token of the most recently appended event.
    async fn head_token(&self) -> Result<EventStoreToken>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends a single event.
    async fn append_event(
        &self,
        stream: &str,
        event: NewEvent,
        expected: EventStoreVersion,
    ) -> Result<AppendResult> {
        self.append_to_stream(stream, vec![event], expected).await
    }

    /// Reads a whole stream with bodies.
    async fn read_all(&self, stream: &str) -> Result<StreamSlice> {
        self.read_stream(stream, Version::first(), usize::MAX, true)
            .await
    }

    /// Returns the stream's current version (0 if it does not exist).
    async fn stream_version(&self, stream: &str) -> Result<Version> {
        Ok(self
            .read_stream(stream, Version::first(), 0, false)
            .await?
            .current_version)
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Validates an append request before touching storage.
pub fn validate_append(stream: &str, events: &[NewEvent]) -> Result<()> {
    if stream.is_empty() {
        return Err(EventStoreError::InvalidAppend(
            "Stream name must not be empty".to_string(),
        ));
    }
    if events.is_empty() {
        return Err(EventStoreError::InvalidAppend(
            "Cannot append empty event list".to_string(),
        ));
    }
    if let Some(event) = events.iter().find(|e| e.event_type.is_empty()) {
        return Err(EventStoreError::InvalidAppend(format!(
            "Event type must not be empty (format {})",
            event.format
        )));
    }
    Ok(())
}
