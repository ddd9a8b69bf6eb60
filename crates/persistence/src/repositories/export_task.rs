//! Export task repository.
//!
//! Every status change is a single `UPDATE ... WHERE id = $1 AND status = $2`
//! so concurrent workers and cancellation requests race on the row, not in
//! application code.

use chrono::{DateTime, Utc};
use domain::models::{ExportStatus, ExportTask, NewExportTask};
use domain::services::{ExportTaskStore, StoreError, Transition, TransitionOutcome};
use sqlx::PgPool;
use uuid::Uuid;

use super::map_sqlx_error;
use crate::entities::ExportTaskEntity;
use crate::metrics::QueryTimer;

const TASK_COLUMNS: &str = "id, owner_id, filter_spec, format, status, progress, estimated_rows, \
     row_count, error_message, artifact_ref, artifact_bytes, artifact_sha256, \
     cancel_requested_at, created_at, started_at, completed_at, expires_at, \
     last_progress_at, purged_at";

/// Postgres-backed task store.
#[derive(Clone)]
pub struct PgExportTaskStore {
    pool: PgPool,
}

impl PgExportTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn into_tasks(entities: Vec<ExportTaskEntity>) -> Result<Vec<ExportTask>, StoreError> {
        entities.into_iter().map(ExportTask::try_from).collect()
    }

    async fn run_transition(
        &self,
        id: Uuid,
        expected: ExportStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportTaskEntity>, sqlx::Error> {
        match transition {
            Transition::Admit => {
                sqlx::query_as::<_, ExportTaskEntity>(&format!(
                    r#"
                    UPDATE export_tasks
                    SET status = 'running', started_at = $3, last_progress_at = $3,
                        updated_at = $3
                    WHERE id = $1 AND status = $2
                    RETURNING {TASK_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(expected.as_str())
                .bind(now)
                .fetch_optional(&self.pool)
                .await
            }
            Transition::Complete {
                row_count,
                artifact,
                expires_at,
            } => {
                sqlx::query_as::<_, ExportTaskEntity>(&format!(
                    r#"
                    UPDATE export_tasks
                    SET status = 'completed', row_count = $3, progress = GREATEST(progress, $3),
                        artifact_ref = $4, artifact_bytes = $5, artifact_sha256 = $6,
                        completed_at = $7, expires_at = $8, updated_at = $7
                    WHERE id = $1 AND status = $2
                    RETURNING {TASK_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(expected.as_str())
                .bind(row_count)
                .bind(&artifact.artifact_ref)
                .bind(artifact.bytes)
                .bind(&artifact.sha256)
                .bind(now)
                .bind(expires_at)
                .fetch_optional(&self.pool)
                .await
            }
            Transition::Fail { message } => {
                sqlx::query_as::<_, ExportTaskEntity>(&format!(
                    r#"
                    UPDATE export_tasks
                    SET status = 'failed', error_message = $3, completed_at = $4,
                        updated_at = $4
                    WHERE id = $1 AND status = $2
                    RETURNING {TASK_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(expected.as_str())
                .bind(&message)
                .bind(now)
                .fetch_optional(&self.pool)
                .await
            }
            Transition::Cancel => {
                sqlx::query_as::<_, ExportTaskEntity>(&format!(
                    r#"
                    UPDATE export_tasks
                    SET status = 'cancelled', completed_at = $3, updated_at = $3,
                        cancel_requested_at = COALESCE(cancel_requested_at, $3)
                    WHERE id = $1 AND status = $2
                    RETURNING {TASK_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(expected.as_str())
                .bind(now)
                .fetch_optional(&self.pool)
                .await
            }
        }
    }
}

#[async_trait::async_trait]
impl ExportTaskStore for PgExportTaskStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let timer = QueryTimer::new("export_tasks_ping");
        let result = sqlx::query("SELECT 1").execute(&self.pool).await;
        timer.observe(&result);
        result.map(|_| ()).map_err(map_sqlx_error)
    }

    async fn create(
        &self,
        new: NewExportTask,
        now: DateTime<Utc>,
    ) -> Result<ExportTask, StoreError> {
        let filter_spec = serde_json::to_value(&new.filter_spec)
            .map_err(|e| StoreError::Database(format!("Failed to encode filter: {}", e)))?;

        let timer = QueryTimer::new("export_tasks_create");
        let result = sqlx::query_as::<_, ExportTaskEntity>(&format!(
            r#"
            INSERT INTO export_tasks (id, owner_id, filter_spec, format, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $5)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(new.id)
        .bind(new.owner_id)
        .bind(filter_spec)
        .bind(new.format.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await;
        timer.observe(&result);

        result.map_err(map_sqlx_error)?.try_into()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ExportTask>, StoreError> {
        let timer = QueryTimer::new("export_tasks_find_by_id");
        let result = sqlx::query_as::<_, ExportTaskEntity>(&format!(
            "SELECT {TASK_COLUMNS} FROM export_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await;
        timer.observe(&result);

        result
            .map_err(map_sqlx_error)?
            .map(ExportTask::try_from)
            .transpose()
    }

    async fn list_for_owner(
        &self,
        owner_id: Uuid,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ExportTask>, StoreError> {
        let (before_at, before_id) = before.unzip();

        let timer = QueryTimer::new("export_tasks_list_for_owner");
        let result = sqlx::query_as::<_, ExportTaskEntity>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM export_tasks
            WHERE owner_id = $1
              AND ($2::timestamptz IS NULL OR (created_at, id) < ($2, $3))
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        ))
        .bind(owner_id)
        .bind(before_at)
        .bind(before_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await;
        timer.observe(&result);

        Self::into_tasks(result.map_err(map_sqlx_error)?)
    }

    async fn count_pending(&self) -> Result<i64, StoreError> {
        let timer = QueryTimer::new("export_tasks_count_pending");
        let result: Result<i64, _> =
            sqlx::query_scalar("SELECT COUNT(*) FROM export_tasks WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await;
        timer.observe(&result);
        result.map_err(map_sqlx_error)
    }

    async fn oldest_pending(&self, limit: i64) -> Result<Vec<ExportTask>, StoreError> {
        let timer = QueryTimer::new("export_tasks_oldest_pending");
        let result = sqlx::query_as::<_, ExportTaskEntity>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM export_tasks
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await;
        timer.observe(&result);

        Self::into_tasks(result.map_err(map_sqlx_error)?)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: ExportStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let target = transition.target();
        if !expected.can_transition_to(target) {
            return Err(StoreError::InvalidTransition {
                from: expected,
                to: target,
            });
        }

        let timer = QueryTimer::new("export_tasks_transition");
        let result = self.run_transition(id, expected, transition, now).await;
        timer.observe(&result);

        match result.map_err(map_sqlx_error)? {
            Some(entity) => Ok(TransitionOutcome::Applied(entity.try_into()?)),
            None => match self.find_by_id(id).await? {
                Some(current) => {
                    tracing::debug!(
                        task_id = %id,
                        expected = %expected,
                        actual = %current.status,
                        target = %target,
                        "Export task transition rejected"
                    );
                    Ok(TransitionOutcome::Rejected(current))
                }
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    async fn record_progress(
        &self,
        id: Uuid,
        rows: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let timer = QueryTimer::new("export_tasks_record_progress");
        let result = sqlx::query(
            r#"
            UPDATE export_tasks
            SET progress = GREATEST(progress, $2), last_progress_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(rows)
        .bind(now)
        .execute(&self.pool)
        .await;
        timer.observe(&result);
        result.map(|_| ()).map_err(map_sqlx_error)
    }

    async fn set_estimated_rows(&self, id: Uuid, rows: i64) -> Result<(), StoreError> {
        let timer = QueryTimer::new("export_tasks_set_estimated_rows");
        let result = sqlx::query("UPDATE export_tasks SET estimated_rows = $2 WHERE id = $1")
            .bind(id)
            .bind(rows)
            .execute(&self.pool)
            .await;
        timer.observe(&result);
        result.map(|_| ()).map_err(map_sqlx_error)
    }

    async fn mark_cancel_requested(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportTask>, StoreError> {
        let timer = QueryTimer::new("export_tasks_mark_cancel_requested");
        let result = sqlx::query_as::<_, ExportTaskEntity>(&format!(
            r#"
            UPDATE export_tasks
            SET cancel_requested_at = COALESCE(cancel_requested_at, $2), updated_at = $2
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await;
        timer.observe(&result);

        match result.map_err(map_sqlx_error)? {
            Some(entity) => Ok(Some(entity.try_into()?)),
            None => self.find_by_id(id).await,
        }
    }

    async fn find_purgeable(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ExportTask>, StoreError> {
        let (after_at, after_id) = after.unzip();

        let timer = QueryTimer::new("export_tasks_find_purgeable");
        let result = sqlx::query_as::<_, ExportTaskEntity>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM export_tasks
            WHERE status = 'completed' AND artifact_ref IS NOT NULL AND expires_at <= $1
              AND ($2::timestamptz IS NULL OR (expires_at, id) > ($2, $3))
            ORDER BY expires_at ASC, id ASC
            LIMIT $4
            "#
        ))
        .bind(cutoff)
        .bind(after_at)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await;
        timer.observe(&result);

        Self::into_tasks(result.map_err(map_sqlx_error)?)
    }

    async fn clear_artifact(
        &self,
        id: Uuid,
        artifact_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let timer = QueryTimer::new("export_tasks_clear_artifact");
        let result = sqlx::query(
            r#"
            UPDATE export_tasks
            SET artifact_ref = NULL, purged_at = $3, updated_at = $3
            WHERE id = $1 AND artifact_ref = $2
            "#,
        )
        .bind(id)
        .bind(artifact_ref)
        .bind(now)
        .execute(&self.pool)
        .await;
        timer.observe(&result);

        Ok(result.map_err(map_sqlx_error)?.rows_affected() > 0)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let timer = QueryTimer::new("export_tasks_delete_terminal_before");
        let result = sqlx::query(
            r#"
            DELETE FROM export_tasks
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND artifact_ref IS NULL
              AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await;
        timer.observe(&result);

        Ok(result.map_err(map_sqlx_error)?.rows_affected())
    }

    async fn fail_running(&self, message: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let timer = QueryTimer::new("export_tasks_fail_running");
        let result = sqlx::query(
            r#"
            UPDATE export_tasks
            SET status = 'failed', error_message = $1, completed_at = $2, updated_at = $2
            WHERE status = 'running'
            "#,
        )
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await;
        timer.observe(&result);

        Ok(result.map_err(map_sqlx_error)?.rows_affected())
    }
}
