//! Filtered consumption of the global event log.
//!
//! An [`EventStreamer`] reads the log through one sub-streamer per
//! (stream prefix × event type) pair and merges them back into a single
//! sequence in token order.

pub mod filter;
pub mod streamer;

pub use event_store::{EventStoreError as StreamingError, Result};
pub use filter::{EventFilter, StreamingMode};
pub use streamer::{DEFAULT_BATCH_SIZE, EventStream, EventStreamer};
