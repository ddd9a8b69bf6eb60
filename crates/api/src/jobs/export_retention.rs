//! Export retention sweep.
//!
//! Deletes expired artifacts and old terminal task records.

use chrono::Utc;
use std::time::Duration;
use tracing::info;

use crate::services::export::ExportService;

use super::scheduler::{Job, JobFrequency};

pub struct ExportRetentionJob {
    exports: ExportService,
    interval: Duration,
}

impl ExportRetentionJob {
    pub fn new(exports: ExportService, interval: Duration) -> Self {
        Self { exports, interval }
    }
}

#[async_trait::async_trait]
impl Job for ExportRetentionJob {
    fn name(&self) -> &'static str {
        "export_retention"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Every(self.interval)
    }

    fn run_on_start(&self) -> bool {
        true
    }

    async fn execute(&self) -> Result<(), String> {
        let report = self
            .exports
            .purge_expired(Utc::now())
            .await
            .map_err(|e| format!("Retention sweep failed: {}", e))?;

        if report.purged > 0 || report.failed > 0 || report.records_deleted > 0 {
            info!(
                purged = report.purged,
                failed = report.failed,
                records_deleted = report.records_deleted,
                "Export retention sweep finished"
            );
        }
        Ok(())
    }
}
