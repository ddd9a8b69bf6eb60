//! In-memory implementations of the export ports.
//!
//! Used by tests and by local runs without a database. The application
//! source supports failure injection so generator error paths can be
//! exercised deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::export_store::{
    ApplicationSource, ExportTaskStore, StoreError, Transition, TransitionOutcome,
};
use crate::models::{
    ExportStatus, ExportTask, FilterSpec, JobApplication, NewExportTask, RecordCursor,
};

/// Task store backed by a map behind an async lock.
#[derive(Debug, Default)]
pub struct InMemoryExportTaskStore {
    tasks: RwLock<HashMap<Uuid, ExportTask>>,
    unavailable: AtomicBool,
}

impl InMemoryExportTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert or replace a task verbatim.
    pub async fn put(&self, task: ExportTask) {
        self.tasks.write().await.insert(task.id, task);
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("task store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ExportTaskStore for InMemoryExportTaskStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn create(
        &self,
        new: NewExportTask,
        now: DateTime<Utc>,
    ) -> Result<ExportTask, StoreError> {
        self.check_available()?;
        let task = ExportTask::new_pending(new, now);
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(task)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ExportTask>, StoreError> {
        self.check_available()?;
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list_for_owner(
        &self,
        owner_id: Uuid,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ExportTask>, StoreError> {
        self.check_available()?;
        let tasks = self.tasks.read().await;
        let mut owned: Vec<ExportTask> = tasks
            .values()
            .filter(|t| t.owner_id == owner_id)
            .filter(|t| match before {
                Some(key) => (t.created_at, t.id) < key,
                None => true,
            })
            .cloned()
            .collect();
        owned.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        owned.truncate(limit.max(0) as usize);
        Ok(owned)
    }

    async fn count_pending(&self) -> Result<i64, StoreError> {
        self.check_available()?;
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.status == ExportStatus::Pending)
            .count() as i64)
    }

    async fn oldest_pending(&self, limit: i64) -> Result<Vec<ExportTask>, StoreError> {
        self.check_available()?;
        let tasks = self.tasks.read().await;
        let mut pending: Vec<ExportTask> = tasks
            .values()
            .filter(|t| t.status == ExportStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| (t.created_at, t.id));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: ExportStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        self.check_available()?;
        let target = transition.target();
        if !expected.can_transition_to(target) {
            return Err(StoreError::InvalidTransition {
                from: expected,
                to: target,
            });
        }

        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.status != expected {
            return Ok(TransitionOutcome::Rejected(task.clone()));
        }
        transition.apply(task, now);
        Ok(TransitionOutcome::Applied(task.clone()))
    }

    async fn record_progress(
        &self,
        id: Uuid,
        rows: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(&id) {
            if task.status == ExportStatus::Running {
                task.progress = task.progress.max(rows);
                task.last_progress_at = Some(now);
            }
        }
        Ok(())
    }

    async fn set_estimated_rows(&self, id: Uuid, rows: i64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(&id) {
            task.estimated_rows = Some(rows);
        }
        Ok(())
    }

    async fn mark_cancel_requested(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportTask>, StoreError> {
        self.check_available()?;
        let mut tasks = self.tasks.write().await;
        Ok(tasks.get_mut(&id).map(|task| {
            if !task.status.is_terminal() && task.cancel_requested_at.is_none() {
                task.cancel_requested_at = Some(now);
            }
            task.clone()
        }))
    }

    async fn find_purgeable(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ExportTask>, StoreError> {
        self.check_available()?;
        let tasks = self.tasks.read().await;
        let mut expired: Vec<(DateTime<Utc>, ExportTask)> = tasks
            .values()
            .filter(|t| t.status == ExportStatus::Completed && t.artifact_ref.is_some())
            .filter_map(|t| t.expires_at.map(|at| (at, t)))
            .filter(|(at, t)| *at <= cutoff && after.map_or(true, |key| (*at, t.id) > key))
            .map(|(at, t)| (at, t.clone()))
            .collect();
        expired.sort_by_key(|(at, t)| (*at, t.id));
        let mut expired: Vec<ExportTask> = expired.into_iter().map(|(_, t)| t).collect();
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn clear_artifact(
        &self,
        id: Uuid,
        artifact_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) if task.artifact_ref.as_deref() == Some(artifact_ref) => {
                task.artifact_ref = None;
                task.purged_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| {
            let expired = t.status.is_terminal()
                && t.artifact_ref.is_none()
                && t.completed_at.is_some_and(|at| at < cutoff);
            !expired
        });
        Ok((before - tasks.len()) as u64)
    }

    async fn fail_running(&self, message: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut tasks = self.tasks.write().await;
        let mut failed = 0;
        for task in tasks.values_mut() {
            if task.status == ExportStatus::Running {
                Transition::Fail {
                    message: message.to_string(),
                }
                .apply(task, now);
                failed += 1;
            }
        }
        Ok(failed)
    }
}

/// Record source backed by a vector of applications.
#[derive(Debug, Default)]
pub struct InMemoryApplicationSource {
    records: RwLock<Vec<JobApplication>>,
    unavailable: AtomicBool,
    /// 1-based batch number that fails, if any.
    fail_on_batch: Option<usize>,
    batches_served: AtomicUsize,
    batch_delay: Option<Duration>,
}

impl InMemoryApplicationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<JobApplication>) -> Self {
        Self {
            records: RwLock::new(records),
            ..Default::default()
        }
    }

    /// Fail the `n`th `fetch_batch` call (1-based) across all tasks.
    pub fn failing_on_batch(mut self, n: usize) -> Self {
        self.fail_on_batch = Some(n);
        self
    }

    /// Sleep before answering each batch.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = Some(delay);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn insert(&self, record: JobApplication) {
        self.records.write().await.push(record);
    }

    /// Number of `fetch_batch` calls answered so far, failures included.
    pub fn batches_served(&self) -> usize {
        self.batches_served.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("record store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ApplicationSource for InMemoryApplicationSource {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn count(&self, owner_id: Uuid, filter: &FilterSpec) -> Result<i64, StoreError> {
        self.check_available()?;
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.owner_id == owner_id && filter.matches(r))
            .count() as i64)
    }

    async fn fetch_batch(
        &self,
        owner_id: Uuid,
        filter: &FilterSpec,
        after: Option<RecordCursor>,
        limit: i64,
    ) -> Result<Vec<JobApplication>, StoreError> {
        if let Some(delay) = self.batch_delay {
            tokio::time::sleep(delay).await;
        }

        let served = self.batches_served.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_batch == Some(served) {
            return Err(StoreError::Unavailable(format!(
                "connection reset while reading batch {}",
                served
            )));
        }
        self.check_available()?;

        let records = self.records.read().await;
        let mut matching: Vec<&JobApplication> = records
            .iter()
            .filter(|r| r.owner_id == owner_id && filter.matches(r))
            .filter(|r| match after {
                Some(cursor) => (r.created_at, r.id) > (cursor.created_at, cursor.id),
                None => true,
            })
            .collect();
        matching.sort_by_key(|r| (r.created_at, r.id));
        Ok(matching
            .into_iter()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
