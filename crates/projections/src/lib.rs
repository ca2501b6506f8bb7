//! Versioned projections with live rebuild and cutover.
//!
//! A logical projection can have several physical instances, each built by
//! a particular code version into its own document folder:
//! - [`ProjectionMetadataManager`] persists the instances and their cursors
//! - [`detect_rebuild_type`] decides whether a worker serves, builds or resumes
//! - [`ProjectionWorker`] feeds an instance from the event log and cuts over
//! - [`ProjectionProxy`] routes reads to the best instance a reader supports
//! - [`EventRouter`] maps event types to handler functions

pub mod config;
pub mod error;
pub mod metadata;
pub mod projection;
pub mod proxy;
pub mod rebuild;
pub mod router;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{ProjectionError, Result};
pub use metadata::{
    MetadataChange, MetadataChanges, ProjectionInstanceMetadata, ProjectionMetadataManager,
    ProjectionStatus,
};
pub use projection::{Projection, ProjectionDefinition};
pub use proxy::{ProjectionProxy, ProjectionReader, Selection, select_reader};
pub use rebuild::{RebuildType, WorkerRole, detect_rebuild_type, pending_build, running_instance};
pub use router::{EventRouter, Handler};
pub use worker::{ProjectionWorker, WorkerExit};
