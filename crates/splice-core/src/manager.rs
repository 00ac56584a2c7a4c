//! The task-manager facade (component C5) and the worker dispatcher (C3).
//!
//! One `TaskManager` per process, shared as `Arc<TaskManager>`. A single
//! write lock guards both in-memory maps, so a task id is present in the
//! progress store iff it is present in the registry and every multi-field
//! update becomes visible atomically. No I/O happens under the lock;
//! repository calls run after release.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::registry::{transition_allowed, TaskHandle, TaskRegistry};
use crate::repository::{
    with_retries, StatusPatch, TaskRepository, TaskRow, VideoRepository,
};
use crate::store::{ProgressRecord, ProgressStore, ProgressUpdate};
use crate::types::{CancelOutcome, TaskError, TaskId, TaskStatus, WorkerError};

#[derive(Debug, Default)]
struct Inner {
    registry: TaskRegistry,
    progress: ProgressStore,
}

/// Process-wide task manager: registration, dispatch, progress, cancellation
/// and cleanup for composition tasks.
pub struct TaskManager {
    inner: RwLock<Inner>,
    repo: Arc<dyn TaskRepository>,
    videos: Arc<dyn VideoRepository>,
    config: ManagerConfig,
    /// Present when `max_concurrent_workers > 0`.
    worker_permits: Option<Arc<Semaphore>>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything a worker needs to execute one task: identity, inputs, the
/// cancel signal, and a way back into the facade.
pub struct WorkerContext {
    manager: Arc<TaskManager>,
    task_id: TaskId,
    cancel_rx: watch::Receiver<bool>,
    user_id: i64,
    video_ids: Vec<i64>,
}

impl WorkerContext {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn video_ids(&self) -> &[i64] {
        &self.video_ids
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    /// Cheap cancellation poll; workers call this before every blocking or
    /// non-trivial step.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// A receiver clone for code that polls from a blocking thread.
    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    /// Report progress with a stage description; the ETA is recomputed from
    /// elapsed time on every report.
    pub async fn report(&self, progress: u8, stage: impl Into<String>) {
        let mut update = ProgressUpdate::report(progress, stage);
        update.estimated_time_remaining = self.manager.estimated_time_remaining(self.task_id).await;
        self.manager.update_progress(self.task_id, update).await;
    }

    /// Write the terminal `cancelled` transition. This is the only path by
    /// which a `processing` task becomes `cancelled`.
    pub async fn finish_cancelled(&self) {
        info!(task_id = %self.task_id, "worker observed cancellation");
        self.manager
            .update_progress(
                self.task_id,
                ProgressUpdate {
                    status: Some(TaskStatus::Cancelled),
                    ..ProgressUpdate::default()
                },
            )
            .await;
    }

    /// Register the output artifact and write the terminal `completed`
    /// transition.
    pub async fn complete(&self, output_file: String, total_duration_secs: Option<i64>) {
        self.manager
            .complete_task(self.task_id, output_file, total_duration_secs)
            .await;
    }
}

impl TaskManager {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        videos: Arc<dyn VideoRepository>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let worker_permits = (config.max_concurrent_workers > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_workers)));
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            repo,
            videos,
            config,
            worker_permits,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn video_repository(&self) -> Arc<dyn VideoRepository> {
        Arc::clone(&self.videos)
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a new composition task and persist its initial row.
    ///
    /// Validates the input shape only; whether the ids resolve to live videos
    /// is the caller's concern (and the worker re-checks during S1).
    pub async fn register(
        &self,
        user_id: i64,
        video_ids: Vec<i64>,
        output_filename: Option<String>,
    ) -> Result<TaskId, TaskError> {
        if video_ids.len() < 2 {
            return Err(TaskError::InvalidArgument(
                "at least two videos are required".into(),
            ));
        }
        let mut seen = HashSet::with_capacity(video_ids.len());
        if !video_ids.iter().all(|id| seen.insert(*id)) {
            return Err(TaskError::InvalidArgument(
                "video list contains duplicates".into(),
            ));
        }

        let task_id = Uuid::new_v4();
        let output_filename = output_filename
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| format!("合成视频_{}.mp4", &task_id.to_string()[..8]));

        let created_at = {
            let mut inner = self.inner.write().await;
            if inner.registry.contains(&task_id) {
                // v4 UUIDs make this unreachable in practice.
                let status = inner
                    .registry
                    .get(&task_id)
                    .map(|h| h.status)
                    .unwrap_or(TaskStatus::Pending);
                error!(task_id = %task_id, "task id collision on register");
                return Err(TaskError::IllegalState { status });
            }
            let handle = TaskHandle::new(task_id, user_id, video_ids.clone());
            let created_at = handle.created_at;
            inner.registry.create(handle);
            inner.progress.create(task_id, TaskStatus::Pending);
            created_at
        };

        let row = TaskRow {
            task_id,
            user_id,
            video_ids: video_ids.clone(),
            status: TaskStatus::Pending,
            progress: 0,
            output_file: None,
            output_filename,
            total_duration_secs: None,
            error_message: None,
            created_at,
            started_at: None,
            completed_at: None,
        };
        with_retries("persist_initial", task_id, || self.repo.persist_initial(&row)).await;

        info!(
            task_id = %task_id,
            user_id,
            videos = video_ids.len(),
            "task registered"
        );
        Ok(task_id)
    }

    // ── Dispatch (C3) ────────────────────────────────────────────────────────

    /// Dispatch a worker for a pending task. At most one worker ever runs per
    /// task. Returns `false` when the task is unknown, not pending, already
    /// has a worker, or the worker pool is saturated (the task is then failed
    /// with "failed to start worker").
    pub async fn start<F, Fut>(self: &Arc<Self>, task_id: TaskId, worker: F) -> bool
    where
        F: FnOnce(WorkerContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        // Admission comes first: the task must not flip to processing unless
        // a worker slot is actually available.
        let permit = match &self.worker_permits {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(task_id = %task_id, "worker pool saturated; dispatch failed");
                    self.fail_dispatch(task_id).await;
                    return false;
                }
            },
            None => None,
        };

        let started_at;
        let ctx = {
            let mut inner = self.inner.write().await;
            let Some(handle) = inner.registry.get_mut(&task_id) else {
                error!(task_id = %task_id, "start: task not found");
                return false;
            };
            if handle.status != TaskStatus::Pending {
                warn!(task_id = %task_id, status = %handle.status, "start: task is not pending");
                return false;
            }
            if handle.worker.is_some() {
                warn!(task_id = %task_id, "start: worker already dispatched");
                return false;
            }
            let now = Utc::now();
            handle.status = TaskStatus::Processing;
            handle.started_at = Some(now);
            handle.last_progress_at = now;
            started_at = now;
            let ctx = WorkerContext {
                manager: Arc::clone(self),
                task_id,
                cancel_rx: handle.cancel_tx.subscribe(),
                user_id: handle.user_id,
                video_ids: handle.video_ids.clone(),
            };
            inner.progress.apply(
                &task_id,
                0,
                &ProgressUpdate {
                    status: Some(TaskStatus::Processing),
                    ..ProgressUpdate::default()
                },
            );
            ctx
        };

        let manager = Arc::clone(self);
        let supervisor = tokio::spawn(async move {
            manager.supervise(task_id, permit, worker(ctx)).await;
        });
        {
            let mut inner = self.inner.write().await;
            if let Some(handle) = inner.registry.get_mut(&task_id) {
                handle.worker = Some(supervisor.abort_handle());
            }
        }

        let persist = Arc::clone(self);
        tokio::spawn(async move {
            persist
                .persist_patch(
                    task_id,
                    StatusPatch {
                        status: Some(TaskStatus::Processing),
                        progress: Some(0),
                        started_at: Some(started_at),
                        ..StatusPatch::default()
                    },
                )
                .await;
        });

        info!(task_id = %task_id, "worker dispatched");
        true
    }

    /// Record a dispatch failure. Only a task still waiting in `pending` is
    /// touched; anything else is left alone and logged.
    async fn fail_dispatch(&self, task_id: TaskId) {
        let patch = {
            let mut inner = self.inner.write().await;
            let Some(handle) = inner.registry.get_mut(&task_id) else {
                warn!(task_id = %task_id, "dispatch failure for unknown task");
                return;
            };
            if handle.status != TaskStatus::Pending {
                warn!(
                    task_id = %task_id,
                    status = %handle.status,
                    "dispatch failure ignored; task is not pending"
                );
                return;
            }
            let now = Utc::now();
            handle.status = TaskStatus::Failed;
            handle.error_message = Some("failed to start worker".into());
            handle.completed_at = Some(now);
            let progress = handle.progress;
            inner.progress.apply(
                &task_id,
                progress,
                &ProgressUpdate::failed("failed to start worker"),
            );
            StatusPatch {
                status: Some(TaskStatus::Failed),
                progress: Some(progress),
                error_message: Some("failed to start worker".into()),
                completed_at: Some(now),
                ..StatusPatch::default()
            }
        };
        self.persist_patch(task_id, patch).await;
    }

    /// Supervises one worker: holds its pool permit, contains panics, and
    /// runs the unconditional finalizer.
    async fn supervise<Fut>(
        self: Arc<Self>,
        task_id: TaskId,
        permit: Option<OwnedSemaphorePermit>,
        worker: Fut,
    ) where
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        // Run the worker in its own task so a panic is contained and the
        // finalizer below runs on every exit path.
        match tokio::spawn(worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(task_id = %task_id, error = %e, "worker reported failure");
                self.update_progress(task_id, ProgressUpdate::failed(e.user_message()))
                    .await;
            }
            Err(join) if join.is_panic() => {
                error!(task_id = %task_id, "worker panicked");
                self.update_progress(task_id, ProgressUpdate::failed("worker crashed"))
                    .await;
            }
            Err(_) => {
                warn!(task_id = %task_id, "worker aborted");
                self.update_progress(task_id, ProgressUpdate::failed("worker aborted"))
                    .await;
            }
        }

        // Release the worker slot ASAP; the finalizer is housekeeping only.
        drop(permit);
        self.finalize(task_id).await;
    }

    /// The worker finalizer: ensure a terminal state, delete scratch space
    /// and partial output, then drop the in-memory entries. The persisted row
    /// outlives them.
    async fn finalize(self: &Arc<Self>, task_id: TaskId) {
        let status = {
            let inner = self.inner.read().await;
            inner.registry.get(&task_id).map(|h| h.status)
        };
        if let Some(status) = status {
            if !status.is_terminal() {
                warn!(task_id = %task_id, status = %status, "worker exited without a terminal status");
                self.update_progress(
                    task_id,
                    ProgressUpdate::failed("worker exited without reporting a result"),
                )
                .await;
            }
        }

        let scratch = crate::worker::scratch_dir(&self.config.output_root, task_id);
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(task_id = %task_id, error = %e, "failed to remove worker scratch dir");
            }
        }

        let completed = {
            let inner = self.inner.read().await;
            inner
                .registry
                .get(&task_id)
                .map(|h| h.status == TaskStatus::Completed)
                .unwrap_or(false)
        };
        if !completed {
            let output = crate::worker::output_path(&self.config.output_root, task_id);
            match tokio::fs::remove_file(&output).await {
                Ok(()) => info!(task_id = %task_id, path = %output.display(), "partial output removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "failed to remove partial output"),
            }
        }

        self.cleanup(task_id).await;
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Consistent snapshot of a task's progress. The ETA is filled in on
    /// demand when the worker has not cached one.
    pub async fn query(&self, task_id: TaskId) -> Result<ProgressRecord, TaskError> {
        let inner = self.inner.read().await;
        let mut record = inner
            .progress
            .get(&task_id)
            .ok_or(TaskError::NotFound(task_id))?;
        if record.estimated_time_remaining.is_none() {
            record.estimated_time_remaining =
                estimate_remaining(record.status, record.progress, record.started_at, Utc::now());
        }
        Ok(record)
    }

    /// Whether cancellation has been requested. `false` for unknown ids.
    pub async fn is_cancelled(&self, task_id: TaskId) -> bool {
        let inner = self.inner.read().await;
        inner
            .registry
            .get(&task_id)
            .map(|h| h.is_cancel_requested() || h.status == TaskStatus::Cancelled)
            .unwrap_or(false)
    }

    /// Estimated seconds remaining for a `processing` task.
    pub async fn estimated_time_remaining(&self, task_id: TaskId) -> Option<u64> {
        let inner = self.inner.read().await;
        let handle = inner.registry.get(&task_id)?;
        estimate_remaining(handle.status, handle.progress, handle.started_at, Utc::now())
    }

    // ── Progress updates ─────────────────────────────────────────────────────

    /// Atomically apply a partial update to both in-memory maps, then push a
    /// best-effort patch to the repository.
    ///
    /// Invariant enforcement lives here: terminal states are immutable,
    /// backward progress is clamped (and logged as a worker anomaly), a
    /// completion without an output file is demoted to `failed`, and 100% is
    /// reserved for `completed`.
    pub async fn update_progress(&self, task_id: TaskId, update: ProgressUpdate) {
        let mut update = update;
        let patch = {
            let mut inner = self.inner.write().await;
            let Some(handle) = inner.registry.get_mut(&task_id) else {
                warn!(task_id = %task_id, "progress update for unknown task");
                return;
            };
            if handle.status.is_terminal() {
                warn!(
                    task_id = %task_id,
                    status = %handle.status,
                    "progress update after terminal state ignored"
                );
                return;
            }

            let mut progress = match update.progress {
                Some(p) => {
                    let p = p.min(100);
                    if p < handle.progress {
                        warn!(
                            task_id = %task_id,
                            stored = handle.progress,
                            incoming = p,
                            "backward progress clamped"
                        );
                        handle.progress
                    } else {
                        p
                    }
                }
                None => handle.progress,
            };

            let mut status = match update.status {
                Some(s) if s == handle.status => None,
                Some(s) if !transition_allowed(handle.status, s) => {
                    warn!(
                        task_id = %task_id,
                        from = %handle.status,
                        to = %s,
                        "illegal status transition ignored"
                    );
                    None
                }
                other => other,
            };

            if status == Some(TaskStatus::Completed) {
                let has_output = update
                    .output_file
                    .as_deref()
                    .or(handle.output_file.as_deref())
                    .is_some_and(|f| !f.is_empty());
                if has_output {
                    progress = 100;
                } else {
                    warn!(task_id = %task_id, "completion without output file demoted to failed");
                    status = Some(TaskStatus::Failed);
                    update.output_file = None;
                    update.error_message = Some("output file missing".into());
                }
            }

            if status == Some(TaskStatus::Failed)
                && update.error_message.as_deref().is_none_or(str::is_empty)
                && handle.error_message.is_none()
            {
                warn!(task_id = %task_id, "failure without a reason; recording generic message");
                update.error_message = Some("unknown worker error".into());
            }

            if progress == 100 && status != Some(TaskStatus::Completed) {
                debug!(task_id = %task_id, "progress 100 outside completed clamped to 99");
                progress = 99;
            }

            update.status = status;
            update.progress = Some(progress);

            if progress > handle.progress {
                handle.last_progress_at = Utc::now();
            }
            handle.progress = progress;
            if let Some(file) = &update.output_file {
                handle.output_file = Some(file.clone());
            }
            if let Some(message) = &update.error_message {
                handle.error_message = Some(message.clone());
            }

            let mut patch = StatusPatch {
                progress: Some(progress),
                error_message: update.error_message.clone(),
                ..StatusPatch::default()
            };
            if let Some(s) = status {
                handle.status = s;
                patch.status = Some(s);
                if s.is_terminal() {
                    let now = Utc::now();
                    handle.completed_at = Some(now);
                    patch.completed_at = Some(now);
                }
            }

            inner.progress.apply(&task_id, progress, &update);
            patch
        };

        self.persist_patch(task_id, patch).await;
    }

    /// Completion path: terminal `completed` update plus the repository's
    /// output attachment. A completion that gets demoted (missing output)
    /// skips the attachment.
    pub(crate) async fn complete_task(
        &self,
        task_id: TaskId,
        output_file: String,
        total_duration_secs: Option<i64>,
    ) {
        self.update_progress(
            task_id,
            ProgressUpdate {
                progress: Some(100),
                status: Some(TaskStatus::Completed),
                output_file: Some(output_file.clone()),
                current_stage: Some("视频合成已完成！".into()),
                ..ProgressUpdate::default()
            },
        )
        .await;

        let completed = {
            let inner = self.inner.read().await;
            inner
                .registry
                .get(&task_id)
                .map(|h| h.status == TaskStatus::Completed)
                .unwrap_or(false)
        };
        if completed {
            with_retries("attach_output", task_id, || {
                self.repo
                    .attach_output(task_id, &output_file, total_duration_secs)
            })
            .await;
            info!(task_id = %task_id, output_file = %output_file, "task completed");
        }
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    /// Cancel a task. Immediate for `pending` tasks; for `processing` tasks
    /// the signal is set and the worker writes the terminal transition at its
    /// next poll point. The call never waits for the worker.
    pub async fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, TaskError> {
        let (outcome, patch) = {
            let mut inner = self.inner.write().await;
            let Some(handle) = inner.registry.get_mut(&task_id) else {
                return Err(TaskError::NotFound(task_id));
            };
            if handle.status.is_terminal() {
                return Err(TaskError::IllegalState {
                    status: handle.status,
                });
            }

            let now = Utc::now();
            handle.signal_cancel();
            match handle.status {
                TaskStatus::Pending => {
                    handle.status = TaskStatus::Cancelled;
                    handle.completed_at = Some(now);
                    let progress = handle.progress;
                    inner.progress.apply(
                        &task_id,
                        progress,
                        &ProgressUpdate {
                            status: Some(TaskStatus::Cancelled),
                            ..ProgressUpdate::default()
                        },
                    );
                    info!(task_id = %task_id, "pending task cancelled");
                    (
                        CancelOutcome {
                            success: true,
                            message: "任务已取消".into(),
                            status: TaskStatus::Cancelled,
                            cancelled_at: now,
                        },
                        Some(StatusPatch {
                            status: Some(TaskStatus::Cancelled),
                            completed_at: Some(now),
                            ..StatusPatch::default()
                        }),
                    )
                }
                TaskStatus::Processing => {
                    info!(task_id = %task_id, "cancellation requested; worker will stop at next poll");
                    (
                        CancelOutcome {
                            success: true,
                            message: "取消请求已发送".into(),
                            status: TaskStatus::Processing,
                            cancelled_at: now,
                        },
                        None,
                    )
                }
                // Terminal statuses returned above.
                _ => unreachable!("terminal status handled earlier"),
            }
        };

        if let Some(patch) = patch {
            self.persist_patch(task_id, patch).await;
        }
        Ok(outcome)
    }

    // ── Cleanup & sweeping ───────────────────────────────────────────────────

    /// Drop the in-memory entries for a task (both maps, atomically).
    /// Idempotent; the persisted row is untouched.
    pub async fn cleanup(&self, task_id: TaskId) {
        let mut inner = self.inner.write().await;
        inner.registry.remove(&task_id);
        inner.progress.remove(&task_id);
    }

    /// Fail every `processing` task whose progress has stalled longer than
    /// the configured worker timeout, and signal its worker to stop.
    pub async fn sweep_stale(&self) {
        let timeout = chrono::Duration::from_std(self.config.worker_timeout)
            .unwrap_or_else(|_| chrono::Duration::hours(2));
        let cutoff = Utc::now() - timeout;

        let stale: Vec<TaskId> = {
            let inner = self.inner.read().await;
            inner
                .registry
                .ids_with_status(TaskStatus::Processing)
                .into_iter()
                .filter(|id| {
                    inner
                        .registry
                        .get(id)
                        .map(|h| h.last_progress_at < cutoff)
                        .unwrap_or(false)
                })
                .collect()
        };

        for task_id in stale {
            warn!(task_id = %task_id, "task timed out without progress");
            {
                let inner = self.inner.read().await;
                if let Some(handle) = inner.registry.get(&task_id) {
                    handle.signal_cancel();
                }
            }
            self.update_progress(task_id, ProgressUpdate::failed("task timeout"))
                .await;
        }
    }

    async fn persist_patch(&self, task_id: TaskId, patch: StatusPatch) {
        with_retries("update_status", task_id, || {
            self.repo.update_status(task_id, &patch)
        })
        .await;
    }

    #[cfg(test)]
    pub(crate) async fn entry_counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        (inner.registry.len(), inner.progress.len())
    }

    #[cfg(test)]
    pub(crate) async fn exists_in_both(&self, task_id: TaskId) -> (bool, bool) {
        let inner = self.inner.read().await;
        (
            inner.registry.contains(&task_id),
            inner.progress.contains(&task_id),
        )
    }
}

/// `elapsed * (100 - progress) / progress`, floored to whole seconds.
/// Only meaningful while the task is processing and has made progress.
pub(crate) fn estimate_remaining(
    status: TaskStatus,
    progress: u8,
    started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<u64> {
    if status != TaskStatus::Processing || progress == 0 {
        return None;
    }
    let started_at = started_at?;
    let elapsed = (now - started_at).num_seconds().max(0) as u64;
    Some(elapsed * (100 - u64::from(progress)) / u64::from(progress))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn eta_formula() {
        let started = Utc::now();
        let now = started + chrono::Duration::seconds(30);
        // 30s elapsed at 25% → 90s remaining.
        assert_eq!(
            estimate_remaining(TaskStatus::Processing, 25, Some(started), now),
            Some(90)
        );
        // 30s elapsed at 75% → 10s remaining.
        assert_eq!(
            estimate_remaining(TaskStatus::Processing, 75, Some(started), now),
            Some(10)
        );
    }

    #[test]
    fn eta_undefined_without_progress_or_outside_processing() {
        let started = Utc::now();
        let now = started + chrono::Duration::seconds(30);
        assert_eq!(
            estimate_remaining(TaskStatus::Processing, 0, Some(started), now),
            None
        );
        assert_eq!(
            estimate_remaining(TaskStatus::Completed, 50, Some(started), now),
            None
        );
        assert_eq!(estimate_remaining(TaskStatus::Processing, 50, None, now), None);
    }
}
