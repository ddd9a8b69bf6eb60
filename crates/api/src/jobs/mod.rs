//! Background job scheduler and job implementations.

mod export_admission;
mod export_metrics;
mod export_retention;
mod scheduler;

pub use export_admission::ExportAdmissionJob;
pub use export_metrics::ExportMetricsJob;
pub use export_retention::ExportRetentionJob;
pub use scheduler::{Job, JobFrequency, JobScheduler};
