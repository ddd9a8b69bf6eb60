//! Bounded export worker pool.
//!
//! Admission moves the oldest `Pending` tasks to `Running`, one
//! compare-and-set per task, while a permit is free. Each admitted task
//! runs on its own tokio task holding the permit; releasing it wakes the
//! admission loop so the next task starts without waiting for a tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use domain::models::{ExportStatus, ExportTask};
use domain::services::{ExportTaskStore, StoreError, Transition, TransitionOutcome};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::generator::{ExportGenerator, GenerationOutcome};
use crate::middleware::metrics::{
    record_export_duration, record_export_finished, set_export_workers_busy,
};

/// Failure message for tasks cut off by a graceful shutdown.
pub const SHUTDOWN_MESSAGE: &str = "interrupted by server shutdown";

/// Failure message for tasks found `Running` at startup.
pub const RESTART_MESSAGE: &str = "interrupted by server restart";

/// First delay before retrying a terminal transition the store refused.
const FINISH_RETRY_INITIAL: Duration = Duration::from_millis(50);

/// Upper bound on the delay between terminal transition attempts.
const FINISH_RETRY_MAX: Duration = Duration::from_secs(2);

/// Static pool settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub capacity: usize,
    /// How long a completed artifact stays downloadable.
    pub retention: chrono::Duration,
}

/// Result of one admission pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionReport {
    pub admitted: usize,
    /// Candidates another admitter or a cancellation got to first.
    pub skipped: usize,
}

/// Runs admitted export tasks with bounded concurrency.
#[derive(Clone)]
pub struct ExportWorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    store: Arc<dyn ExportTaskStore>,
    generator: ExportGenerator,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    /// Cancellation handles of admitted tasks, keyed by task id.
    in_flight: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Serializes admission passes within this process.
    admission: Mutex<()>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    wake: Arc<Notify>,
}

impl ExportWorkerPool {
    pub fn new(
        store: Arc<dyn ExportTaskStore>,
        generator: ExportGenerator,
        settings: PoolSettings,
    ) -> Self {
        let capacity = settings.capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                store,
                generator,
                permits: Arc::new(Semaphore::new(capacity)),
                settings: PoolSettings {
                    capacity,
                    ..settings
                },
                in_flight: Mutex::new(HashMap::new()),
                admission: Mutex::new(()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                wake: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.settings.capacity
    }

    /// Workers currently holding a permit.
    pub fn running_count(&self) -> usize {
        self.inner.settings.capacity - self.inner.permits.available_permits()
    }

    pub fn retention(&self) -> chrono::Duration {
        self.inner.settings.retention
    }

    /// Handle the admission job waits on between ticks.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.inner.wake.clone()
    }

    /// Ask for an admission pass as soon as possible.
    pub fn notify(&self) {
        self.inner.wake.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Reachability of the task store and the record store.
    pub async fn ping_stores(&self) -> Result<(), StoreError> {
        self.inner.store.ping().await?;
        self.inner.generator.source().ping().await
    }

    /// Fail tasks a previous process left `Running` and discard its
    /// partial files. Must run before the first admission pass.
    pub async fn recover(&self) -> Result<u64, StoreError> {
        match self.inner.generator.storage().clean_staging() {
            Ok(0) => {}
            Ok(removed) => info!(removed = removed, "Removed stale staging files"),
            Err(e) => warn!(error = %e, "Failed to clean export staging area"),
        }

        let failed = self
            .inner
            .store
            .fail_running(RESTART_MESSAGE, Utc::now())
            .await?;
        if failed > 0 {
            warn!(failed = failed, "Failed export tasks interrupted by restart");
            record_export_finished(ExportStatus::Failed, failed);
        }
        Ok(failed)
    }

    /// Admit as many pending tasks as there are free workers.
    ///
    /// When either store is unreachable the pass is skipped and tasks stay
    /// `Pending` for the next one.
    pub async fn admit_pending(&self) -> Result<AdmissionReport, StoreError> {
        let inner = &self.inner;
        let _guard = inner.admission.lock().await;
        let mut report = AdmissionReport::default();

        if inner.shutdown.is_cancelled() {
            return Ok(report);
        }
        let available = inner.permits.available_permits();
        if available == 0 {
            return Ok(report);
        }

        self.ping_stores().await?;

        let candidates = inner.store.oldest_pending(available as i64).await?;
        for task in candidates {
            let Ok(permit) = inner.permits.clone().try_acquire_owned() else {
                break;
            };

            let token = inner.shutdown.child_token();
            {
                let mut in_flight = inner.in_flight.lock().await;
                if in_flight.contains_key(&task.id) {
                    report.skipped += 1;
                    continue;
                }
                in_flight.insert(task.id, token.clone());
            }

            let outcome = inner
                .store
                .transition(task.id, ExportStatus::Pending, Transition::Admit, Utc::now())
                .await;
            match outcome {
                Ok(TransitionOutcome::Applied(task)) => {
                    report.admitted += 1;
                    self.spawn_worker(task, token, permit);
                }
                Ok(TransitionOutcome::Rejected(current)) => {
                    debug!(
                        task_id = %current.id,
                        status = %current.status,
                        "Export task no longer pending"
                    );
                    inner.in_flight.lock().await.remove(&task.id);
                    report.skipped += 1;
                }
                Err(e) => {
                    inner.in_flight.lock().await.remove(&task.id);
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// Signal the worker running `task_id`. Returns `false` when no worker
    /// in this process holds the task.
    pub async fn request_cancel(&self, task_id: Uuid) -> bool {
        match self.inner.in_flight.lock().await.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop admitting, cancel running workers and wait up to `grace` for
    /// them to record a terminal state.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.tracker.close();

        let running = self.running_count();
        if running > 0 {
            info!(running = running, "Waiting for export workers to stop");
        }

        match tokio::time::timeout(grace, inner.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    running = self.running_count(),
                    grace_secs = grace.as_secs(),
                    "Export workers did not stop within the grace period"
                );
                false
            }
        }
    }

    fn spawn_worker(&self, task: ExportTask, token: CancellationToken, permit: OwnedSemaphorePermit) {
        let inner = self.inner.clone();
        set_export_workers_busy(self.running_count());

        let span = info_span!("export_task", task_id = %task.id, owner_id = %task.owner_id);
        self.inner.tracker.spawn(
            async move {
                let task_id = task.id;
                inner.run_task(task, &token).await;

                inner.in_flight.lock().await.remove(&task_id);
                drop(permit);
                set_export_workers_busy(
                    inner.settings.capacity - inner.permits.available_permits(),
                );
                inner.wake.notify_one();
            }
            .instrument(span),
        );
    }
}

impl PoolInner {
    async fn run_task(&self, task: ExportTask, token: &CancellationToken) {
        let started = Instant::now();
        info!(
            task_id = %task.id,
            owner_id = %task.owner_id,
            format = %task.format,
            "Export task started"
        );

        self.generator.estimate(&task).await;

        let status = match self.generator.run(&task, token).await {
            Ok(GenerationOutcome::Completed {
                row_count,
                artifact,
            }) => self.complete(&task, row_count, artifact).await,
            Ok(GenerationOutcome::Cancelled { rows_written }) => {
                self.stop_cancelled(&task, rows_written).await
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Export generation failed");
                self.finish(
                    &task,
                    Transition::Fail {
                        message: e.to_string(),
                    },
                )
                .await
            }
        };

        if let Some(status) = status {
            record_export_finished(status, 1);
            record_export_duration(task.format, status, started.elapsed().as_secs_f64());
        }
    }

    async fn complete(
        &self,
        task: &ExportTask,
        row_count: i64,
        artifact: domain::services::StoredArtifact,
    ) -> Option<ExportStatus> {
        let now = Utc::now();
        let artifact_ref = artifact.artifact_ref.clone();
        let transition = Transition::Complete {
            row_count,
            artifact,
            expires_at: now + self.settings.retention,
        };

        let status = self.finish(task, transition).await;
        if status == Some(ExportStatus::Completed) {
            info!(task_id = %task.id, rows = row_count, "Export task completed");
        } else if let Err(e) = self.generator.storage().delete(&artifact_ref) {
            warn!(task_id = %task.id, error = %e, "Failed to delete unpublished artifact");
        }
        status
    }

    /// A worker stopped on its token: user cancellation if one was
    /// recorded, otherwise shutdown.
    async fn stop_cancelled(&self, task: &ExportTask, rows_written: i64) -> Option<ExportStatus> {
        let user_requested = match self.store.find_by_id(task.id).await {
            Ok(Some(current)) => current.cancel_requested_at.is_some(),
            Ok(None) => return None,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to read cancelled export task");
                !self.shutdown.is_cancelled()
            }
        };

        if user_requested {
            info!(task_id = %task.id, rows = rows_written, "Export task cancelled");
            self.finish(task, Transition::Cancel).await
        } else {
            info!(task_id = %task.id, rows = rows_written, "Export task interrupted by shutdown");
            self.finish(
                task,
                Transition::Fail {
                    message: SHUTDOWN_MESSAGE.to_string(),
                },
            )
            .await
        }
    }

    /// Apply the worker's terminal transition. Returns the status the
    /// worker recorded, or `None` if the task had already moved on.
    ///
    /// Store errors are retried with capped backoff while the worker keeps
    /// its permit, so the task never sits `Running` without an owner. Once
    /// shutdown starts a failed attempt is final and the task is left for
    /// restart recovery.
    async fn finish(&self, task: &ExportTask, transition: Transition) -> Option<ExportStatus> {
        let target = transition.target();
        let mut delay = FINISH_RETRY_INITIAL;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let outcome = self
                .store
                .transition(task.id, ExportStatus::Running, transition.clone(), Utc::now())
                .await;
            match outcome {
                Ok(TransitionOutcome::Applied(_)) => {
                    if attempt > 1 {
                        info!(task_id = %task.id, attempts = attempt, "Recorded export task outcome after retry");
                    }
                    return Some(target);
                }
                Ok(TransitionOutcome::Rejected(current)) => {
                    warn!(
                        task_id = %task.id,
                        status = %current.status,
                        wanted = %target,
                        "Export task changed state under its worker"
                    );
                    return None;
                }
                Err(e) if self.shutdown.is_cancelled() => {
                    error!(
                        task_id = %task.id,
                        wanted = %target,
                        attempts = attempt,
                        error = %e,
                        "Failed to record export task outcome before shutdown"
                    );
                    return None;
                }
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        wanted = %target,
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to record export task outcome, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                    delay = (delay * 2).min(FINISH_RETRY_MAX);
                }
            }
        }
    }
}
