//! Periodic gauge sampling for the export engine.

use sqlx::PgPool;

use crate::middleware::metrics::{set_export_backlog, set_export_workers_busy};
use crate::services::export::ExportService;

use super::scheduler::{Job, JobFrequency};

/// Refreshes the busy-worker and backlog gauges, plus database pool
/// occupancy when running against Postgres.
///
/// A task cancelled while pending never reaches a worker, so the backlog
/// gauge is only accurate after a sample.
pub struct ExportMetricsJob {
    exports: ExportService,
    db: Option<PgPool>,
}

impl ExportMetricsJob {
    pub fn new(exports: ExportService) -> Self {
        Self { exports, db: None }
    }

    pub fn with_database(mut self, pool: PgPool) -> Self {
        self.db = Some(pool);
        self
    }
}

#[async_trait::async_trait]
impl Job for ExportMetricsJob {
    fn name(&self) -> &'static str {
        "export_metrics"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Seconds(10)
    }

    fn run_on_start(&self) -> bool {
        true
    }

    async fn execute(&self) -> Result<(), String> {
        set_export_workers_busy(self.exports.pool().running_count());

        let pending = self
            .exports
            .store()
            .count_pending()
            .await
            .map_err(|e| format!("Failed to count pending exports: {}", e))?;
        set_export_backlog(pending);

        if let Some(db) = &self.db {
            persistence::metrics::record_pool_metrics(db);
        }
        Ok(())
    }
}
