//! Ports used by the export engine.
//!
//! `ExportTaskStore` is the single source of truth for task state; every
//! status change goes through [`ExportTaskStore::transition`], a
//! compare-and-set keyed on the expected current status.
//! `ApplicationSource` is the read-only record store the generator pages
//! through.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ExportStatus, ExportTask, FilterSpec, JobApplication, NewExportTask, RecordCursor,
};

/// Errors returned by the task store and the record source.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Export task not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: ExportStatus, to: ExportStatus },
}

/// A committed artifact, as recorded on a completed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub artifact_ref: String,
    pub bytes: i64,
    pub sha256: String,
}

/// A requested status change.
#[derive(Debug, Clone)]
pub enum Transition {
    /// `Pending -> Running`; takes the execution lease.
    Admit,
    /// `Running -> Completed`; the artifact must already be committed.
    Complete {
        row_count: i64,
        artifact: StoredArtifact,
        expires_at: DateTime<Utc>,
    },
    /// `Running -> Failed`.
    Fail { message: String },
    /// `Pending | Running -> Cancelled`.
    Cancel,
}

impl Transition {
    pub fn target(&self) -> ExportStatus {
        match self {
            Transition::Admit => ExportStatus::Running,
            Transition::Complete { .. } => ExportStatus::Completed,
            Transition::Fail { .. } => ExportStatus::Failed,
            Transition::Cancel => ExportStatus::Cancelled,
        }
    }

    /// Apply this transition to a task already known to be in the expected
    /// state.
    pub fn apply(self, task: &mut ExportTask, now: DateTime<Utc>) {
        task.status = self.target();
        match self {
            Transition::Admit => {
                task.started_at = Some(now);
                task.last_progress_at = Some(now);
            }
            Transition::Complete {
                row_count,
                artifact,
                expires_at,
            } => {
                task.progress = task.progress.max(row_count);
                task.row_count = Some(row_count);
                task.artifact_ref = Some(artifact.artifact_ref);
                task.artifact_bytes = Some(artifact.bytes);
                task.artifact_sha256 = Some(artifact.sha256);
                task.completed_at = Some(now);
                task.expires_at = Some(expires_at);
            }
            Transition::Fail { message } => {
                task.error_message = Some(message);
                task.completed_at = Some(now);
            }
            Transition::Cancel => {
                task.cancel_requested_at.get_or_insert(now);
                task.completed_at = Some(now);
            }
        }
    }
}

/// Result of a compare-and-set.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The task was in the expected state and now holds the new one.
    Applied(ExportTask),
    /// The task was in a different state; it is returned unchanged.
    Rejected(ExportTask),
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn task(&self) -> &ExportTask {
        match self {
            TransitionOutcome::Applied(task) | TransitionOutcome::Rejected(task) => task,
        }
    }

    pub fn into_task(self) -> ExportTask {
        match self {
            TransitionOutcome::Applied(task) | TransitionOutcome::Rejected(task) => task,
        }
    }
}

/// Durable store of export task records.
#[async_trait::async_trait]
pub trait ExportTaskStore: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert a new `Pending` task.
    async fn create(&self, new: NewExportTask, now: DateTime<Utc>)
        -> Result<ExportTask, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ExportTask>, StoreError>;

    /// An owner's tasks, newest first, strictly after the `(created_at, id)`
    /// keyset position when one is given.
    async fn list_for_owner(
        &self,
        owner_id: Uuid,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ExportTask>, StoreError>;

    async fn count_pending(&self) -> Result<i64, StoreError>;

    /// Oldest `Pending` tasks first.
    async fn oldest_pending(&self, limit: i64) -> Result<Vec<ExportTask>, StoreError>;

    /// Compare-and-set on status.
    ///
    /// Returns `InvalidTransition` when `expected -> transition.target()` is
    /// not an edge of the state machine, and `Rejected` with the current
    /// record when the task is no longer in `expected`.
    async fn transition(
        &self,
        id: Uuid,
        expected: ExportStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Record rows written so far. Progress never decreases and only
    /// `Running` tasks are touched.
    async fn record_progress(
        &self,
        id: Uuid,
        rows: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_estimated_rows(&self, id: Uuid, rows: i64) -> Result<(), StoreError>;

    /// Flag a non-terminal task as cancel-requested. The first request's
    /// timestamp wins.
    async fn mark_cancel_requested(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportTask>, StoreError>;

    /// Completed tasks whose artifact expired at or before `cutoff`, in
    /// `(expires_at, id)` order strictly after `after` when one is given.
    async fn find_purgeable(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ExportTask>, StoreError>;

    /// Clear the artifact reference if it still equals `artifact_ref`.
    async fn clear_artifact(
        &self,
        id: Uuid,
        artifact_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete terminal tasks finished before `cutoff` that hold no artifact.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Fail every `Running` task. Used at startup, when no worker can hold a
    /// lease yet.
    async fn fail_running(&self, message: &str, now: DateTime<Utc>)
        -> Result<u64, StoreError>;
}

/// Read-only record store queried by the generator.
#[async_trait::async_trait]
pub trait ApplicationSource: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Number of an owner's records matching `filter`.
    async fn count(&self, owner_id: Uuid, filter: &FilterSpec) -> Result<i64, StoreError>;

    /// Up to `limit` matching records ordered by `(created_at, id)`
    /// ascending, strictly after `after`.
    async fn fetch_batch(
        &self,
        owner_id: Uuid,
        filter: &FilterSpec,
        after: Option<RecordCursor>,
        limit: i64,
    ) -> Result<Vec<JobApplication>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExportFormat;

    #[test]
    fn test_transition_targets() {
        assert_eq!(Transition::Admit.target(), ExportStatus::Running);
        assert_eq!(Transition::Cancel.target(), ExportStatus::Cancelled);
        assert_eq!(
            Transition::Fail {
                message: "x".into()
            }
            .target(),
            ExportStatus::Failed
        );
    }

    #[test]
    fn test_apply_complete_sets_artifact_and_timestamps() {
        let now = Utc::now();
        let mut task = ExportTask::new_pending(
            NewExportTask::new(Uuid::new_v4(), FilterSpec::default(), ExportFormat::Csv),
            now,
        );
        Transition::Admit.apply(&mut task, now);
        assert_eq!(task.status, ExportStatus::Running);
        assert_eq!(task.started_at, Some(now));

        let expires_at = now + chrono::Duration::hours(1);
        Transition::Complete {
            row_count: 7,
            artifact: StoredArtifact {
                artifact_ref: "a.csv".into(),
                bytes: 10,
                sha256: "abc".into(),
            },
            expires_at,
        }
        .apply(&mut task, now);

        assert_eq!(task.status, ExportStatus::Completed);
        assert_eq!(task.row_count, Some(7));
        assert_eq!(task.progress, 7);
        assert_eq!(task.artifact_ref.as_deref(), Some("a.csv"));
        assert_eq!(task.expires_at, Some(expires_at));
        assert!(task.error_message.is_none());
    }
}
