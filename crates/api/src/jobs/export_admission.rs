//! Export admission job.
//!
//! Moves pending exports onto free workers. Runs on a short interval and
//! whenever a task is created or a worker is released.

use std::sync::Arc;
use std::time::Duration;

use domain::services::StoreError;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::services::export::ExportService;

use super::scheduler::{Job, JobFrequency};

pub struct ExportAdmissionJob {
    exports: ExportService,
    interval: Duration,
}

impl ExportAdmissionJob {
    pub fn new(exports: ExportService, interval: Duration) -> Self {
        Self { exports, interval }
    }
}

#[async_trait::async_trait]
impl Job for ExportAdmissionJob {
    fn name(&self) -> &'static str {
        "export_admission"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Every(self.interval)
    }

    fn trigger(&self) -> Option<Arc<Notify>> {
        Some(self.exports.pool().wake_handle())
    }

    fn run_on_start(&self) -> bool {
        true
    }

    async fn execute(&self) -> Result<(), String> {
        let pool = self.exports.pool();
        match pool.admit_pending().await {
            Ok(report) if report.admitted > 0 => {
                info!(
                    admitted = report.admitted,
                    running = pool.running_count(),
                    "Admitted export tasks"
                );
            }
            Ok(_) => {}
            // Tasks stay pending; the next tick retries.
            Err(StoreError::Unavailable(reason)) => {
                warn!(reason = %reason, "Store unavailable, export admission deferred");
                return Ok(());
            }
            Err(e) => return Err(format!("Export admission failed: {}", e)),
        }
        Ok(())
    }
}
