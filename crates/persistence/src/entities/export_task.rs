//! Export task entity.

use chrono::{DateTime, Utc};
use domain::models::{ExportFormat, ExportStatus, ExportTask, FilterSpec};
use domain::services::StoreError;
use sqlx::FromRow;
use uuid::Uuid;

/// Database row for an export task.
#[derive(Debug, Clone, FromRow)]
pub struct ExportTaskEntity {
    pub id: Uuid,
    pub owner_id: Uuid,

    /// Filter parameters as JSONB.
    pub filter_spec: serde_json::Value,

    /// csv, xlsx or json.
    pub format: String,

    /// pending, running, completed, failed or cancelled.
    pub status: String,

    pub progress: i64,
    pub estimated_rows: Option<i64>,
    pub row_count: Option<i64>,
    pub error_message: Option<String>,
    pub artifact_ref: Option<String>,
    pub artifact_bytes: Option<i64>,
    pub artifact_sha256: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub purged_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExportTaskEntity> for ExportTask {
    type Error = StoreError;

    fn try_from(entity: ExportTaskEntity) -> Result<Self, Self::Error> {
        let status = entity
            .status
            .parse::<ExportStatus>()
            .map_err(StoreError::Database)?;
        let format = entity
            .format
            .parse::<ExportFormat>()
            .map_err(StoreError::Database)?;
        let filter_spec: FilterSpec = serde_json::from_value(entity.filter_spec).map_err(|e| {
            StoreError::Database(format!("Corrupt filter_spec on task {}: {}", entity.id, e))
        })?;

        Ok(ExportTask {
            id: entity.id,
            owner_id: entity.owner_id,
            filter_spec,
            format,
            status,
            progress: entity.progress,
            estimated_rows: entity.estimated_rows,
            row_count: entity.row_count,
            error_message: entity.error_message,
            artifact_ref: entity.artifact_ref,
            artifact_bytes: entity.artifact_bytes,
            artifact_sha256: entity.artifact_sha256,
            cancel_requested_at: entity.cancel_requested_at,
            created_at: entity.created_at,
            started_at: entity.started_at,
            completed_at: entity.completed_at,
            expires_at: entity.expires_at,
            last_progress_at: entity.last_progress_at,
            purged_at: entity.purged_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> ExportTaskEntity {
        let now = Utc::now();
        ExportTaskEntity {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            filter_spec: serde_json::json!({"statuses": ["applied"], "fields": ["company"]}),
            format: "xlsx".to_string(),
            status: "running".to_string(),
            progress: 12,
            estimated_rows: Some(40),
            row_count: None,
            error_message: None,
            artifact_ref: None,
            artifact_bytes: None,
            artifact_sha256: None,
            cancel_requested_at: None,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            expires_at: None,
            last_progress_at: Some(now),
            purged_at: None,
        }
    }

    #[test]
    fn test_entity_to_domain_conversion() {
        let task = ExportTask::try_from(entity()).unwrap();
        assert_eq!(task.status, ExportStatus::Running);
        assert_eq!(task.format, ExportFormat::Xlsx);
        assert_eq!(task.filter_spec.statuses, vec!["applied".to_string()]);
        assert_eq!(task.progress, 12);
    }

    #[test]
    fn test_unknown_status_is_a_database_error() {
        let mut row = entity();
        row.status = "expired".to_string();
        assert!(matches!(
            ExportTask::try_from(row),
            Err(StoreError::Database(_))
        ));
    }

    #[test]
    fn test_corrupt_filter_is_a_database_error() {
        let mut row = entity();
        row.filter_spec = serde_json::json!({"fields": ["nope"]});
        assert!(ExportTask::try_from(row).is_err());
    }
}
