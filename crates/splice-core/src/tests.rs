use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::manager::TaskManager;
use crate::repository::{
    PersistenceError, StatusPatch, TaskRepository, TaskRow, VideoMeta, VideoRepository,
};
use crate::store::ProgressUpdate;
use crate::types::{TaskError, TaskId, TaskStatus};

// ── In-memory port implementations ───────────────────────────────────────────

#[derive(Default)]
struct MemoryRepo {
    rows: Mutex<HashMap<TaskId, TaskRow>>,
}

impl MemoryRepo {
    fn row(&self, task_id: TaskId) -> Option<TaskRow> {
        self.rows.lock().unwrap().get(&task_id).cloned()
    }
}

#[async_trait]
impl TaskRepository for MemoryRepo {
    async fn persist_initial(&self, row: &TaskRow) -> Result<(), PersistenceError> {
        self.rows.lock().unwrap().insert(row.task_id, row.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        task_id: TaskId,
        patch: &StatusPatch,
    ) -> Result<(), PersistenceError> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&task_id) {
            if let Some(status) = patch.status {
                row.status = status;
            }
            if let Some(progress) = patch.progress {
                row.progress = progress;
            }
            if let Some(message) = &patch.error_message {
                row.error_message = Some(message.clone());
            }
            if let Some(at) = patch.started_at {
                row.started_at = Some(at);
            }
            if let Some(at) = patch.completed_at {
                row.completed_at = Some(at);
            }
        }
        Ok(())
    }

    async fn attach_output(
        &self,
        task_id: TaskId,
        file_ref: &str,
        total_duration_secs: Option<i64>,
    ) -> Result<(), PersistenceError> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&task_id) {
            row.output_file = Some(file_ref.to_owned());
            row.total_duration_secs = total_duration_secs;
        }
        Ok(())
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<TaskRow>, PersistenceError> {
        Ok(self.row(task_id))
    }
}

#[derive(Default)]
struct MemoryVideos {
    videos: HashMap<i64, VideoMeta>,
}

#[async_trait]
impl VideoRepository for MemoryVideos {
    async fn get(&self, video_id: i64) -> Result<Option<VideoMeta>, PersistenceError> {
        Ok(self.videos.get(&video_id).cloned())
    }
}

struct Harness {
    manager: Arc<TaskManager>,
    repo: Arc<MemoryRepo>,
    _output_root: tempfile::TempDir,
}

fn make_harness() -> Harness {
    make_harness_with(|_| {})
}

fn make_harness_with(tweak: impl FnOnce(&mut ManagerConfig)) -> Harness {
    let output_root = tempfile::tempdir().expect("temp output root");
    let mut config = ManagerConfig {
        output_root: output_root.path().to_path_buf(),
        ..ManagerConfig::default()
    };
    tweak(&mut config);
    let repo = Arc::new(MemoryRepo::default());
    let videos = Arc::new(MemoryVideos::default());
    Harness {
        manager: TaskManager::new(repo.clone(), videos, config),
        repo,
        _output_root: output_root,
    }
}

/// Poll the persisted row until the predicate holds.
async fn wait_for_row(
    repo: &MemoryRepo,
    task_id: TaskId,
    predicate: impl Fn(&TaskRow) -> bool,
) -> TaskRow {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let row = repo.row(task_id);
            if let Some(row) = row {
                if predicate(&row) {
                    return row;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("row should reach the expected state")
}

async fn wait_terminal(repo: &MemoryRepo, task_id: TaskId) -> TaskRow {
    wait_for_row(repo, task_id, |row| row.status.is_terminal()).await
}

// ── Registration ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn register_rejects_short_lists_and_duplicates() {
    let h = make_harness();

    let err = h.manager.register(1, vec![], None).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidArgument(_)));

    let err = h.manager.register(1, vec![5], None).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidArgument(_)));

    let err = h.manager.register(1, vec![5, 6, 5], None).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidArgument(_)));

    // Nothing was created.
    assert_eq!(h.manager.entry_counts().await, (0, 0));
}

#[tokio::test]
async fn register_creates_both_entries_and_persists_pending_row() {
    let h = make_harness();
    let id = h.manager.register(7, vec![11, 12], None).await.unwrap();

    assert_eq!(h.manager.exists_in_both(id).await, (true, true));

    let record = h.manager.query(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Pending);
    assert_eq!(record.progress, 0);

    let row = h.repo.row(id).expect("initial row persisted");
    assert_eq!(row.status, TaskStatus::Pending);
    assert_eq!(row.user_id, 7);
    assert_eq!(row.video_ids, vec![11, 12]);
    assert!(row.output_filename.ends_with(".mp4"));
}

// ── Happy path (scenario A analogue with a stub worker) ──────────────────────

#[tokio::test]
async fn stub_worker_runs_to_completion() {
    let h = make_harness();
    let id = h.manager.register(7, vec![11, 12], None).await.unwrap();

    let started = h
        .manager
        .start(id, |ctx| async move {
            for (progress, stage) in [
                (10u8, "正在验证视频文件 (1/2)"),
                (30, "视频文件验证完成，准备开始合成..."),
                (70, "正在合并视频片段..."),
                (95, "正在写入合成视频文件..."),
            ] {
                ctx.report(progress, stage).await;
            }
            ctx.complete("composed/out.mp4".into(), Some(120)).await;
            Ok(())
        })
        .await;
    assert!(started);

    let row = wait_for_row(&h.repo, id, |row| {
        row.status == TaskStatus::Completed && row.output_file.is_some()
    })
    .await;
    assert_eq!(row.progress, 100);
    assert_eq!(row.output_file.as_deref(), Some("composed/out.mp4"));
    assert_eq!(row.total_duration_secs, Some(120));
    assert!(row.error_message.is_none());
    let started_at = row.started_at.expect("started_at set");
    let completed_at = row.completed_at.expect("completed_at set");
    assert!(row.created_at <= started_at);
    assert!(started_at <= completed_at);

    // The finalizer dropped both in-memory entries together.
    wait_for_cleanup(&h.manager, id).await;
    assert!(matches!(
        h.manager.query(id).await,
        Err(TaskError::NotFound(_))
    ));
}

async fn wait_for_cleanup(manager: &Arc<TaskManager>, task_id: TaskId) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if manager.exists_in_both(task_id).await == (false, false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("in-memory entries should be cleaned up");
}

// ── Invariants ───────────────────────────────────────────────────────────────

#[tokio::test]
#[tracing_test::traced_test]
async fn backward_progress_is_clamped() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    h.manager
        .update_progress(
            id,
            ProgressUpdate {
                progress: Some(50),
                ..ProgressUpdate::default()
            },
        )
        .await;
    h.manager
        .update_progress(
            id,
            ProgressUpdate {
                progress: Some(20),
                ..ProgressUpdate::default()
            },
        )
        .await;

    let record = h.manager.query(id).await.unwrap();
    assert_eq!(record.progress, 50, "backward write must be clamped");
    assert!(logs_contain("backward progress clamped"));

    h.manager
        .update_progress(
            id,
            ProgressUpdate {
                progress: Some(60),
                ..ProgressUpdate::default()
            },
        )
        .await;
    assert_eq!(h.manager.query(id).await.unwrap().progress, 60);
}

#[tokio::test]
async fn hundred_percent_is_reserved_for_completion() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    h.manager
        .update_progress(
            id,
            ProgressUpdate {
                progress: Some(100),
                ..ProgressUpdate::default()
            },
        )
        .await;
    assert_eq!(h.manager.query(id).await.unwrap().progress, 99);
}

#[tokio::test]
async fn terminal_state_is_immutable() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    let outcome = h.manager.cancel(id).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, TaskStatus::Cancelled);

    // Later writes bounce off the terminal state.
    h.manager
        .update_progress(
            id,
            ProgressUpdate {
                progress: Some(70),
                status: Some(TaskStatus::Processing),
                ..ProgressUpdate::default()
            },
        )
        .await;
    let record = h.manager.query(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(record.progress, 0);

    // Cancelling a terminal task reports the current status.
    let err = h.manager.cancel(id).await.unwrap_err();
    assert_eq!(
        err,
        TaskError::IllegalState {
            status: TaskStatus::Cancelled
        }
    );
}

#[tokio::test]
async fn completion_without_output_is_demoted_to_failed() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    let started = h
        .manager
        .start(id, |ctx| async move {
            let manager = Arc::clone(ctx.manager());
            manager
                .update_progress(
                    ctx.task_id(),
                    ProgressUpdate {
                        progress: Some(100),
                        status: Some(TaskStatus::Completed),
                        ..ProgressUpdate::default()
                    },
                )
                .await;
            Ok(())
        })
        .await;
    assert!(started);

    let row = wait_terminal(&h.repo, id).await;
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("output file missing"));
    assert!(row.output_file.is_none());
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_pending_is_immediate_and_worker_never_runs() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    let outcome = h.manager.cancel(id).await.unwrap();
    assert!(outcome.success);

    let record = h.manager.query(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(record.progress, 0);

    // Dispatch after cancellation is refused.
    let started = h
        .manager
        .start(id, |_ctx| async move {
            panic!("worker must never run for a cancelled task");
        })
        .await;
    assert!(!started);

    let row = h.repo.row(id).unwrap();
    assert_eq!(row.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn cancel_processing_is_asynchronous() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    let started = h
        .manager
        .start(id, |ctx| async move {
            let mut progress = 5u8;
            loop {
                if ctx.is_cancelled() {
                    ctx.finish_cancelled().await;
                    return Ok(());
                }
                ctx.report(progress.min(95), "正在处理...").await;
                progress = progress.saturating_add(1);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
    assert!(started);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let outcome = h.manager.cancel(id).await.unwrap();
    assert!(outcome.success);
    // The cancel call does not wait for the worker.
    assert_eq!(outcome.status, TaskStatus::Processing);
    assert!(h.manager.is_cancelled(id).await);

    let row = wait_terminal(&h.repo, id).await;
    assert_eq!(row.status, TaskStatus::Cancelled);
    assert!(row.error_message.is_none());
}

#[tokio::test]
async fn repeated_cancel_of_processing_task_is_idempotent() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    let started = h
        .manager
        .start(id, |ctx| async move {
            loop {
                if ctx.is_cancelled() {
                    ctx.finish_cancelled().await;
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    assert!(started);

    let first = h.manager.cancel(id).await;
    let second = h.manager.cancel(id).await;
    // Both calls either succeed or (once the worker has finished) report the
    // terminal state; neither may hang or corrupt anything.
    assert!(first.is_ok());
    match second {
        Ok(outcome) => assert!(outcome.success),
        Err(err) => assert_eq!(
            err,
            TaskError::IllegalState {
                status: TaskStatus::Cancelled
            }
        ),
    }

    let row = wait_terminal(&h.repo, id).await;
    assert_eq!(row.status, TaskStatus::Cancelled);
}

// ── Unknown-id safety ────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_ids_are_safe() {
    let h = make_harness();
    let unknown = Uuid::new_v4();

    assert!(matches!(
        h.manager.query(unknown).await,
        Err(TaskError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.cancel(unknown).await,
        Err(TaskError::NotFound(_))
    ));
    assert!(!h.manager.is_cancelled(unknown).await);
    // Cleanup of an unknown id is a no-op.
    h.manager.cleanup(unknown).await;
}

// ── Dispatch (I6) ────────────────────────────────────────────────────────────

#[tokio::test]
async fn at_most_one_worker_per_task() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    let first = h
        .manager
        .start(id, |ctx| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.complete("composed/out.mp4".into(), None).await;
            Ok(())
        })
        .await;
    assert!(first);

    let second = h
        .manager
        .start(id, |_ctx| async move {
            panic!("second worker must never run");
        })
        .await;
    assert!(!second);

    let row = wait_terminal(&h.repo, id).await;
    assert_eq!(row.status, TaskStatus::Completed);

    // A finished task cannot be restarted either.
    wait_for_cleanup(&h.manager, id).await;
    let third = h.manager.start(id, |_ctx| async move { Ok(()) }).await;
    assert!(!third);
}

#[tokio::test]
async fn saturated_worker_pool_fails_dispatch() {
    let h = make_harness_with(|cfg| {
        cfg.max_concurrent_workers = 1;
    });
    let first = h.manager.register(1, vec![1, 2], None).await.unwrap();
    let second = h.manager.register(1, vec![3, 4], None).await.unwrap();

    let started = h
        .manager
        .start(first, |ctx| async move {
            loop {
                if ctx.is_cancelled() {
                    ctx.finish_cancelled().await;
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    assert!(started);

    // The only slot is held by the first worker, so the second dispatch is
    // refused synchronously and the task is failed.
    let started = h
        .manager
        .start(second, |_ctx| async move {
            panic!("a saturated pool must not run another worker");
        })
        .await;
    assert!(!started);

    let record = h.manager.query(second).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("failed to start worker"));
    let row = wait_terminal(&h.repo, second).await;
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("failed to start worker"));

    // Once the first worker finishes, its slot frees up for new dispatches.
    h.manager.cancel(first).await.unwrap();
    wait_for_cleanup(&h.manager, first).await;

    let third = h.manager.register(1, vec![5, 6], None).await.unwrap();
    let started = h
        .manager
        .start(third, |ctx| async move {
            ctx.complete("composed/out.mp4".into(), None).await;
            Ok(())
        })
        .await;
    assert!(started);
    let row = wait_terminal(&h.repo, third).await;
    assert_eq!(row.status, TaskStatus::Completed);
}

// ── Worker failure containment ───────────────────────────────────────────────

#[tokio::test]
async fn worker_error_records_failure_reason() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    let started = h
        .manager
        .start(id, |_ctx| async move {
            Err(crate::types::WorkerError::InvalidInput(
                "not enough valid source videos".into(),
            ))
        })
        .await;
    assert!(started);

    let row = wait_terminal(&h.repo, id).await;
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(
        row.error_message.as_deref(),
        Some("not enough valid source videos")
    );
}

#[tokio::test]
async fn worker_panic_is_contained_and_recorded() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    let started = h
        .manager
        .start(id, |_ctx| async move {
            panic!("worker bug");
        })
        .await;
    assert!(started);

    let row = wait_terminal(&h.repo, id).await;
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("worker crashed"));

    wait_for_cleanup(&h.manager, id).await;
}

// ── Stale sweeper ────────────────────────────────────────────────────────────

#[tokio::test]
async fn sweeper_fails_stalled_tasks_and_signals_the_worker() {
    let h = make_harness_with(|cfg| {
        cfg.worker_timeout = Duration::from_millis(50);
    });
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    let started = h
        .manager
        .start(id, |ctx| async move {
            // A stalled worker: never reports progress, only polls.
            loop {
                if ctx.is_cancelled() {
                    ctx.finish_cancelled().await;
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
    assert!(started);

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.manager.sweep_stale().await;

    let row = wait_terminal(&h.repo, id).await;
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("task timeout"));
}

// ── Concurrent queries (scenario F analogue) ─────────────────────────────────

#[tokio::test]
async fn concurrent_queries_see_consistent_snapshots() {
    let h = make_harness();
    let id = h.manager.register(1, vec![1, 2], None).await.unwrap();

    let started = h
        .manager
        .start(id, |ctx| async move {
            for progress in (1..=95).step_by(2) {
                ctx.report(progress, format!("正在处理 {progress}%")).await;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            ctx.complete("composed/out.mp4".into(), Some(60)).await;
            Ok(())
        })
        .await;
    assert!(started);

    let mut readers = Vec::new();
    for _ in 0..10 {
        let manager = Arc::clone(&h.manager);
        readers.push(tokio::spawn(async move {
            let mut last_progress = 0u8;
            for _ in 0..100 {
                match manager.query(id).await {
                    Ok(record) => {
                        assert!(
                            record.progress >= last_progress,
                            "progress went backwards: {} -> {}",
                            last_progress,
                            record.progress
                        );
                        last_progress = record.progress;
                        if record.status == TaskStatus::Completed {
                            assert!(record.output_file.is_some());
                            assert_eq!(record.progress, 100);
                        }
                        if record.status == TaskStatus::Failed {
                            assert!(record.error_message.is_some());
                        }
                    }
                    // The finalizer may have cleaned up already.
                    Err(TaskError::NotFound(_)) => break,
                    Err(other) => panic!("unexpected query error: {other}"),
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }
    for reader in readers {
        reader.await.expect("reader should not panic");
    }

    let row = wait_terminal(&h.repo, id).await;
    assert_eq!(row.status, TaskStatus::Completed);
}
