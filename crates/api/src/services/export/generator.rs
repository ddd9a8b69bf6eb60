//! Export generation.
//!
//! Drives one admitted task from its filter to a committed artifact:
//! matching records are read a batch at a time, in a stable order, and
//! written straight through a format writer into a staged file.

use std::sync::Arc;

use chrono::Utc;
use domain::models::{ExportTask, RecordCursor};
use domain::services::{ApplicationSource, ExportTaskStore, StoreError, StoredArtifact};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::storage::{ArtifactStorage, StorageError};
use super::writers::{writer_for, WriterError};
use crate::middleware::metrics::record_export_rows;

/// Errors that fail a task.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Record source error: {0}")]
    Source(#[from] StoreError),

    #[error("{0}")]
    Writer(#[from] WriterError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("Export exceeds the maximum of {limit} rows")]
    RowLimit { limit: i64 },
}

/// How a generation run ended, short of an error.
#[derive(Debug)]
pub enum GenerationOutcome {
    /// The artifact is committed to storage.
    Completed {
        row_count: i64,
        artifact: StoredArtifact,
    },
    /// Cancellation was observed; nothing was published.
    Cancelled { rows_written: i64 },
}

/// Streams matching records into an artifact.
pub struct ExportGenerator {
    source: Arc<dyn ApplicationSource>,
    store: Arc<dyn ExportTaskStore>,
    storage: ArtifactStorage,
    batch_size: i64,
    max_rows: i64,
}

impl ExportGenerator {
    /// `max_rows` of zero means unbounded.
    pub fn new(
        source: Arc<dyn ApplicationSource>,
        store: Arc<dyn ExportTaskStore>,
        storage: ArtifactStorage,
        batch_size: i64,
        max_rows: i64,
    ) -> Self {
        Self {
            source,
            store,
            storage,
            batch_size: batch_size.max(1),
            max_rows,
        }
    }

    pub fn storage(&self) -> &ArtifactStorage {
        &self.storage
    }

    pub fn source(&self) -> &Arc<dyn ApplicationSource> {
        &self.source
    }

    /// Record a row estimate for progress reporting. Failures only cost
    /// the percentage, so they are logged and ignored.
    pub async fn estimate(&self, task: &ExportTask) {
        let estimate = match self.source.count(task.owner_id, &task.filter_spec).await {
            Ok(count) => count,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to estimate export size");
                return;
            }
        };
        if let Err(e) = self.store.set_estimated_rows(task.id, estimate).await {
            warn!(task_id = %task.id, error = %e, "Failed to record export estimate");
        }
    }

    /// Generate the artifact for `task`.
    ///
    /// `cancel` is checked before every batch and once more before the
    /// artifact is published, so a cancellation takes effect within one
    /// batch. Any early return drops the staged file.
    pub async fn run(
        &self,
        task: &ExportTask,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let fields = task.filter_spec.selected_fields();
        let staged = self.storage.stage(task.id, task.format)?;
        let mut writer = writer_for(task.format, staged.writer_file()?)?;
        writer.write_header(&fields)?;

        let mut after: Option<RecordCursor> = None;
        let mut written: i64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(GenerationOutcome::Cancelled {
                    rows_written: written,
                });
            }

            let batch = self
                .source
                .fetch_batch(task.owner_id, &task.filter_spec, after, self.batch_size)
                .await?;
            let fetched = batch.len() as i64;
            if fetched == 0 {
                break;
            }
            if self.max_rows > 0 && written + fetched > self.max_rows {
                return Err(GenerationError::RowLimit {
                    limit: self.max_rows,
                });
            }

            for record in &batch {
                writer.write_row(&record.row(&fields))?;
            }
            written += fetched;
            after = batch.last().map(|record| record.cursor());
            record_export_rows(task.format, fetched as u64);

            if let Err(e) = self.store.record_progress(task.id, written, Utc::now()).await {
                warn!(task_id = %task.id, error = %e, "Failed to record export progress");
            }
            debug!(task_id = %task.id, rows = written, "Export batch written");

            if fetched < self.batch_size {
                break;
            }
        }

        let receipt = writer.finalize()?;
        drop(writer);

        if cancel.is_cancelled() {
            return Ok(GenerationOutcome::Cancelled {
                rows_written: written,
            });
        }

        let artifact = self.storage.commit(staged, receipt)?;
        Ok(GenerationOutcome::Completed {
            row_count: receipt.rows,
            artifact,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use domain::models::{ExportFormat, ExportStatus, FilterSpec, JobApplication, NewExportTask};
    use domain::services::{InMemoryApplicationSource, InMemoryExportTaskStore, Transition};
    use uuid::Uuid;

    fn record(owner_id: Uuid, company: &str, offset_secs: i64) -> JobApplication {
        let created_at = Utc::now() - Duration::hours(1) + Duration::seconds(offset_secs);
        JobApplication {
            id: Uuid::new_v4(),
            owner_id,
            company: company.to_string(),
            position: "Engineer".to_string(),
            status: "applied".to_string(),
            location: None,
            salary_min: Some(100),
            salary_max: None,
            source: None,
            job_url: None,
            notes: None,
            applied_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<InMemoryExportTaskStore>,
        source: Arc<InMemoryApplicationSource>,
        generator: ExportGenerator,
        owner_id: Uuid,
    }

    fn fixture(records: usize, batch_size: i64, max_rows: i64) -> Fixture {
        fixture_with(records, batch_size, max_rows, |source| source)
    }

    fn fixture_with(
        records: usize,
        batch_size: i64,
        max_rows: i64,
        configure: impl FnOnce(InMemoryApplicationSource) -> InMemoryApplicationSource,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let owner_id = Uuid::new_v4();
        let source = Arc::new(configure(InMemoryApplicationSource::with_records(
            (0..records)
                .map(|i| record(owner_id, &format!("Company {}", i), i as i64))
                .collect(),
        )));
        let store = Arc::new(InMemoryExportTaskStore::new());
        let storage = ArtifactStorage::new(dir.path()).unwrap();
        let generator = ExportGenerator::new(
            source.clone(),
            store.clone(),
            storage,
            batch_size,
            max_rows,
        );
        Fixture {
            _dir: dir,
            store,
            source,
            generator,
            owner_id,
        }
    }

    async fn running_task(fx: &Fixture, format: ExportFormat) -> ExportTask {
        let task = fx
            .store
            .create(
                NewExportTask::new(fx.owner_id, FilterSpec::default(), format),
                Utc::now(),
            )
            .await
            .unwrap();
        fx.store
            .transition(task.id, ExportStatus::Pending, Transition::Admit, Utc::now())
            .await
            .unwrap()
            .into_task()
    }

    #[tokio::test]
    async fn test_generates_all_rows_in_batches() {
        let fx = fixture(25, 10, 0);
        let task = running_task(&fx, ExportFormat::Csv).await;

        let outcome = fx
            .generator
            .run(&task, &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            GenerationOutcome::Completed {
                row_count,
                artifact,
            } => {
                assert_eq!(row_count, 25);
                assert!(fx.generator.storage().exists(&artifact.artifact_ref));
                assert_eq!(artifact.sha256.len(), 64);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fx.source.batches_served(), 3);

        let stored = fx.store.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 25);
    }

    #[tokio::test]
    async fn test_empty_result_still_produces_header_only_file() {
        let fx = fixture(0, 10, 0);
        let task = running_task(&fx, ExportFormat::Json).await;

        let outcome = fx
            .generator
            .run(&task, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GenerationOutcome::Completed { row_count: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch_publishes_nothing() {
        let fx = fixture(5, 10, 0);
        let task = running_task(&fx, ExportFormat::Csv).await;
        let token = CancellationToken::new();
        token.cancel();

        let outcome = fx.generator.run(&task, &token).await.unwrap();
        assert!(matches!(
            outcome,
            GenerationOutcome::Cancelled { rows_written: 0 }
        ));
        assert_eq!(fx.source.batches_served(), 0);
        assert!(!fx
            .generator
            .storage()
            .exists(&format!("{}.csv", task.id)));
    }

    #[tokio::test]
    async fn test_row_limit_fails_generation() {
        let fx = fixture(12, 5, 8);
        let task = running_task(&fx, ExportFormat::Xlsx).await;

        let err = fx
            .generator
            .run(&task, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::RowLimit { limit: 8 }));
        assert!(err.to_string().contains("maximum of 8 rows"));
        assert!(!fx
            .generator
            .storage()
            .exists(&format!("{}.xlsx", task.id)));
    }

    #[tokio::test]
    async fn test_source_failure_mid_run_is_an_error() {
        let fx = fixture_with(30, 10, 0, |source| source.failing_on_batch(2));
        let task = running_task(&fx, ExportFormat::Csv).await;

        let err = fx
            .generator
            .run(&task, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Source(_)));
    }

    #[tokio::test]
    async fn test_estimate_records_matching_count() {
        let fx = fixture(7, 10, 0);
        let task = running_task(&fx, ExportFormat::Csv).await;

        fx.generator.estimate(&task).await;

        let stored = fx.store.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.estimated_rows, Some(7));
    }
}
