//! Database entity definitions.
//!
//! Entities are direct mappings to database rows.

pub mod export_task;
pub mod job_application;

pub use export_task::ExportTaskEntity;
pub use job_application::JobApplicationEntity;
