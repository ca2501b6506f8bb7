//! Cross-node mutual exclusion on top of the document store.
//!
//! A lock is a document whose content is empty (free) or the id of the node
//! holding it. Locks are advisory: nothing stops a party from overwriting
//! the document directly.

pub mod config;
pub mod error;
pub mod manager;

pub use config::LockConfig;
pub use error::{LockError, Result};
pub use manager::{LockMode, LockOutcome, NodeLockManager};
