//! Asynchronous bulk export engine.
//!
//! A request becomes a `Pending` task; the worker pool admits it, the
//! generator streams matching records through a format writer into staged
//! storage, and the artifact is published before the task is marked
//! `Completed`. The retention sweep later deletes expired artifacts.

pub mod generator;
pub mod pool;
pub mod service;
pub mod storage;
pub mod writers;

pub use generator::{ExportGenerator, GenerationError, GenerationOutcome};
pub use pool::{AdmissionReport, ExportWorkerPool, PoolSettings, RESTART_MESSAGE, SHUTDOWN_MESSAGE};
pub use service::{
    DownloadArtifact, ExportError, ExportService, PurgeReport, Requester, ServiceSettings,
};
pub use storage::{ArtifactStorage, StorageError};
