//! Shared types and plumbing for the event-sourcing storage engine.
//!
//! - [`NodeId`] identifies a worker process (lock holder, instance builder)
//! - [`validate_name`] enforces the character set for folder and document names
//! - [`config`] helpers read settings from environment variables
//! - [`listen`] runs a reconnecting Postgres `LISTEN` loop
//! - [`AbortOnDrop`] ties a background task's lifetime to its owner

pub mod config;
pub mod listen;
pub mod task;
pub mod types;

pub use listen::{ListenEvent, spawn_listener};
pub use task::AbortOnDrop;
pub use types::{MAX_NAME_LEN, NameError, NodeId, validate_name};
