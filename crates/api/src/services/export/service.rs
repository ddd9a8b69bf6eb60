//! Export request facade.
//!
//! Everything the HTTP layer asks of the engine goes through
//! [`ExportService`]: creation, status, history, cancellation, download and
//! capability discovery. It also owns the retention sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use domain::models::{
    CancelExportResponse, CreateExportRequest, CreateExportResponse, ExportField, ExportFormat,
    ExportHistoryQuery, ExportHistoryResponse, ExportStatus, ExportTask, ExportTaskResponse,
    FieldInfo, FieldsResponse, FormatInfo, FormatsResponse, NewExportTask, TemplateColumn,
    TemplateResponse, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT,
};
use domain::services::{ExportTaskStore, StoreError, Transition, TransitionOutcome};
use shared::pagination::{decode_cursor, encode_cursor};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use super::pool::ExportWorkerPool;
use super::storage::{ArtifactStorage, StorageError};
use crate::middleware::metrics::{
    record_artifacts_purged, record_export_created, record_export_finished,
};

/// Export facade errors.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Validation failed: {0}")]
    Invalid(#[from] validator::ValidationErrors),

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("Export task not found")]
    NotFound(Uuid),

    #[error("Export is not ready for download (status: {0})")]
    NotReady(ExportStatus),

    #[error("Export artifact has expired")]
    Gone(Uuid),

    #[error("Too many pending exports ({pending}), try again later")]
    CapacityExhausted { pending: i64, retry_after_secs: u64 },

    #[error("Invalid cursor")]
    InvalidCursor,

    #[error("Task store error: {0}")]
    Store(#[from] StoreError),

    #[error("Artifact storage error: {0}")]
    Storage(#[from] StorageError),
}

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub user_id: Uuid,
    pub is_admin: bool,
}

impl Requester {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }

    fn can_access(&self, task: &ExportTask) -> bool {
        self.is_admin || task.owner_id == self.user_id
    }
}

/// Facade settings.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub enabled_formats: Vec<ExportFormat>,
    /// 0 disables the backlog bound.
    pub max_pending: i64,
    pub stall_threshold: chrono::Duration,
    /// Hint returned with a capacity rejection.
    pub retry_after_secs: u64,
    pub record_retention: Option<chrono::Duration>,
    /// Page size of the expired-artifact scan.
    pub purge_batch: i64,
}

/// An open artifact ready to stream.
#[derive(Debug)]
pub struct DownloadArtifact {
    pub file: tokio::fs::File,
    pub len: u64,
    pub file_name: String,
    pub content_type: &'static str,
    pub sha256: Option<String>,
}

/// Outcome of one retention sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: usize,
    pub failed: usize,
    pub records_deleted: u64,
}

#[derive(Clone)]
pub struct ExportService {
    store: Arc<dyn ExportTaskStore>,
    storage: ArtifactStorage,
    pool: ExportWorkerPool,
    settings: Arc<ServiceSettings>,
}

impl ExportService {
    pub fn new(
        store: Arc<dyn ExportTaskStore>,
        storage: ArtifactStorage,
        pool: ExportWorkerPool,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            storage,
            pool,
            settings: Arc::new(settings),
        }
    }

    pub fn pool(&self) -> &ExportWorkerPool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<dyn ExportTaskStore> {
        &self.store
    }

    /// Validate and enqueue a new export.
    pub async fn create(
        &self,
        requester: Requester,
        request: CreateExportRequest,
    ) -> Result<CreateExportResponse, ExportError> {
        let format = self.enabled_format(&request.format)?;
        request.filter.validate()?;

        if self.settings.max_pending > 0 {
            let pending = self.store.count_pending().await?;
            if pending >= self.settings.max_pending {
                warn!(pending = pending, "Export backlog full, rejecting request");
                return Err(ExportError::CapacityExhausted {
                    pending,
                    retry_after_secs: self.settings.retry_after_secs,
                });
            }
        }

        let task = self
            .store
            .create(
                NewExportTask::new(requester.user_id, request.filter, format),
                Utc::now(),
            )
            .await?;

        info!(
            task_id = %task.id,
            owner_id = %task.owner_id,
            format = %task.format,
            "Export task created"
        );
        record_export_created(task.format);
        self.pool.notify();

        Ok(CreateExportResponse {
            task_id: task.id,
            status: task.status,
            created_at: task.created_at,
        })
    }

    pub async fn get(
        &self,
        requester: Requester,
        task_id: Uuid,
    ) -> Result<ExportTaskResponse, ExportError> {
        let task = self.find_accessible(requester, task_id).await?;
        Ok(self.project(task, Utc::now()))
    }

    /// One page of history, newest first.
    pub async fn list(
        &self,
        requester: Requester,
        query: ExportHistoryQuery,
    ) -> Result<ExportHistoryResponse, ExportError> {
        let owner_id = match query.owner {
            Some(owner) if requester.is_admin => owner,
            _ => requester.user_id,
        };
        let limit = query
            .limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let before = match query.cursor.as_deref() {
            Some(cursor) => Some(decode_cursor(cursor).map_err(|_| ExportError::InvalidCursor)?),
            None => None,
        };

        let mut tasks = self
            .store
            .list_for_owner(owner_id, before, limit + 1)
            .await?;

        let next_cursor = if tasks.len() as i64 > limit {
            tasks.truncate(limit as usize);
            tasks.last().map(|t| encode_cursor(t.created_at, t.id))
        } else {
            None
        };

        let now = Utc::now();
        Ok(ExportHistoryResponse {
            data: tasks.into_iter().map(|t| self.project(t, now)).collect(),
            next_cursor,
        })
    }

    /// Request cancellation. Terminal tasks report their status unchanged.
    pub async fn cancel(
        &self,
        requester: Requester,
        task_id: Uuid,
    ) -> Result<CancelExportResponse, ExportError> {
        let mut task = self.find_accessible(requester, task_id).await?;

        if task.status == ExportStatus::Pending {
            match self
                .store
                .transition(task_id, ExportStatus::Pending, Transition::Cancel, Utc::now())
                .await?
            {
                TransitionOutcome::Applied(cancelled) => {
                    info!(task_id = %task_id, "Pending export task cancelled");
                    record_export_finished(ExportStatus::Cancelled, 1);
                    return Ok(cancel_response(&cancelled));
                }
                // Admitted in the meantime; fall through to the running path.
                TransitionOutcome::Rejected(current) => task = current,
            }
        }

        if task.status == ExportStatus::Running {
            if let Some(flagged) = self.store.mark_cancel_requested(task_id, Utc::now()).await? {
                task = flagged;
            }
            let signalled = self.pool.request_cancel(task_id).await;
            info!(
                task_id = %task_id,
                signalled = signalled,
                "Cancellation requested for running export task"
            );
        }

        Ok(cancel_response(&task))
    }

    /// Open a completed task's artifact.
    pub async fn download(
        &self,
        requester: Requester,
        task_id: Uuid,
    ) -> Result<DownloadArtifact, ExportError> {
        let task = self.find_accessible(requester, task_id).await?;

        if task.status != ExportStatus::Completed {
            return Err(ExportError::NotReady(task.status));
        }
        let artifact_ref = task.artifact_ref.as_deref().ok_or(ExportError::Gone(task_id))?;

        let (file, len) = match self.storage.open(artifact_ref).await {
            Ok(opened) => opened,
            Err(StorageError::NotFound(_)) => {
                warn!(task_id = %task_id, "Artifact missing for completed export task");
                return Err(ExportError::Gone(task_id));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(DownloadArtifact {
            file,
            len,
            file_name: download_file_name(&task),
            content_type: task.format.content_type(),
            sha256: task.artifact_sha256,
        })
    }

    pub fn formats(&self) -> FormatsResponse {
        FormatsResponse {
            formats: self
                .settings
                .enabled_formats
                .iter()
                .copied()
                .map(FormatInfo::from)
                .collect(),
        }
    }

    pub fn fields(&self) -> FieldsResponse {
        FieldsResponse {
            fields: ExportField::ALL
                .iter()
                .map(|field| FieldInfo {
                    field: *field,
                    header: field.header().to_string(),
                })
                .collect(),
        }
    }

    /// Column layout of an export in `format` (CSV when omitted).
    pub fn template(&self, format: Option<&str>) -> Result<TemplateResponse, ExportError> {
        let format = match format {
            Some(name) => self.enabled_format(name)?,
            None => self
                .settings
                .enabled_formats
                .first()
                .copied()
                .unwrap_or(ExportFormat::Csv),
        };

        Ok(TemplateResponse {
            format,
            content_type: format.content_type().to_string(),
            columns: ExportField::ALL
                .iter()
                .map(|field| TemplateColumn {
                    field: *field,
                    header: field.header().to_string(),
                    example: field.example().to_json(),
                })
                .collect(),
            example_request: serde_json::json!({
                "format": format,
                "filter": {
                    "statuses": ["applied", "interviewing"],
                    "company": "acme",
                    "appliedFrom": "2024-01-01T00:00:00Z",
                    "fields": ["company", "position", "status", "applied_at"]
                }
            }),
        })
    }

    /// Delete expired artifacts, then old terminal task records.
    ///
    /// Expired tasks are paged by `(expires_at, id)` until a short page comes
    /// back. Each artifact is purged independently; a failure leaves that
    /// task's reference in place for the next sweep and the scan moves past it.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport, ExportError> {
        let mut report = PurgeReport::default();
        let page_size = self.settings.purge_batch.max(1);
        let mut after = None;

        loop {
            let page = self.store.find_purgeable(now, after, page_size).await?;
            let short_page = (page.len() as i64) < page_size;
            if let Some(last) = page.last() {
                after = last.expires_at.map(|at| (at, last.id));
            }

            for task in &page {
                self.purge_artifact(task, now, &mut report).await;
            }
            if short_page || after.is_none() {
                break;
            }
        }
        record_artifacts_purged(report.purged as u64);

        if let Some(retention) = self.settings.record_retention {
            report.records_deleted = self.store.delete_terminal_before(now - retention).await?;
            if report.records_deleted > 0 {
                info!(deleted = report.records_deleted, "Deleted old export task records");
            }
        }

        Ok(report)
    }

    async fn purge_artifact(&self, task: &ExportTask, now: DateTime<Utc>, report: &mut PurgeReport) {
        let Some(artifact_ref) = task.artifact_ref.as_deref() else {
            return;
        };
        if let Err(e) = self.storage.delete(artifact_ref) {
            warn!(task_id = %task.id, error = %e, "Failed to delete expired artifact");
            report.failed += 1;
            return;
        }
        match self.store.clear_artifact(task.id, artifact_ref, now).await {
            Ok(true) => {
                info!(task_id = %task.id, "Export artifact purged");
                report.purged += 1;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to clear artifact reference");
                report.failed += 1;
            }
        }
    }

    async fn find_accessible(
        &self,
        requester: Requester,
        task_id: Uuid,
    ) -> Result<ExportTask, ExportError> {
        match self.store.find_by_id(task_id).await? {
            Some(task) if requester.can_access(&task) => Ok(task),
            _ => Err(ExportError::NotFound(task_id)),
        }
    }

    fn enabled_format(&self, name: &str) -> Result<ExportFormat, ExportError> {
        name.parse::<ExportFormat>()
            .ok()
            .filter(|format| self.settings.enabled_formats.contains(format))
            .ok_or_else(|| ExportError::UnsupportedFormat(name.to_string()))
    }

    fn project(&self, task: ExportTask, now: DateTime<Utc>) -> ExportTaskResponse {
        ExportTaskResponse::from_task(task, now, self.settings.stall_threshold)
    }
}

fn cancel_response(task: &ExportTask) -> CancelExportResponse {
    CancelExportResponse {
        task_id: task.id,
        status: task.status,
        cancel_requested: task.cancel_requested_at.is_some(),
    }
}

fn download_file_name(task: &ExportTask) -> String {
    let id = task.id.simple().to_string();
    format!("applications-{}.{}", &id[..8], task.format.extension())
}
