//! Domain services for JobTrack exports.
//!
//! Ports the export engine depends on, plus in-memory adapters.

pub mod export_store;
pub mod memory;

pub use export_store::{
    ApplicationSource, ExportTaskStore, StoreError, StoredArtifact, Transition,
    TransitionOutcome,
};
pub use memory::{InMemoryApplicationSource, InMemoryExportTaskStore};
