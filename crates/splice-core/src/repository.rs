//! Ports to the external persistent stores (component C6).
//!
//! The engine never talks SQL. It drives these two narrow traits; the server
//! crate implements them over its connection pool, which hands out a fresh
//! connection per call — connection objects never cross into a worker's
//! execution scope.
//!
//! Persistence is a best-effort projection of the authoritative in-memory
//! state: a transient failure is retried a bounded number of times and then
//! downgraded to a warning.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::types::{TaskId, TaskStatus};

/// A persisted task row, as stored by the repository.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub task_id: TaskId,
    pub user_id: i64,
    pub video_ids: Vec<i64>,
    pub status: TaskStatus,
    pub progress: u8,
    pub output_file: Option<String>,
    pub output_filename: String,
    pub total_duration_secs: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields pushed to the repository when live state changes.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A transient repository failure. The engine retries and then continues;
/// in-memory state stays authoritative.
#[derive(Debug, Clone, Error)]
#[error("persistence failure: {0}")]
pub struct PersistenceError(pub String);

/// Persistent task store (one row per task, outliving the in-memory entry).
#[async_trait]
pub trait TaskRepository: Send + Sync + 'static {
    async fn persist_initial(&self, row: &TaskRow) -> Result<(), PersistenceError>;

    async fn update_status(
        &self,
        task_id: TaskId,
        patch: &StatusPatch,
    ) -> Result<(), PersistenceError>;

    /// Record the finished artifact on the task row.
    async fn attach_output(
        &self,
        task_id: TaskId,
        file_ref: &str,
        total_duration_secs: Option<i64>,
    ) -> Result<(), PersistenceError>;

    async fn load(&self, task_id: TaskId) -> Result<Option<TaskRow>, PersistenceError>;
}

/// Source-video metadata, resolved per id during stage S1.
#[derive(Debug, Clone)]
pub struct VideoMeta {
    pub id: i64,
    pub title: String,
    pub file_path: PathBuf,
    pub duration_secs: Option<f64>,
}

/// Lookup of source-video metadata. `Ok(None)` means the id is unknown or
/// the video has been deactivated.
#[async_trait]
pub trait VideoRepository: Send + Sync + 'static {
    async fn get(&self, video_id: i64) -> Result<Option<VideoMeta>, PersistenceError>;
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Run a repository operation with bounded retries. On exhaustion the failure
/// is logged and swallowed: the caller's in-memory state is authoritative.
pub(crate) async fn with_retries<F, Fut>(operation: &str, task_id: TaskId, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), PersistenceError>>,
{
    let mut last_error = None;
    for attempt in 1..=RETRY_ATTEMPTS {
        match f().await {
            Ok(()) => return,
            Err(e) => {
                last_error = Some(e);
                if attempt < RETRY_ATTEMPTS {
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
            }
        }
    }
    warn!(
        task_id = %task_id,
        operation,
        error = %last_error.expect("at least one attempt ran"),
        "repository operation failed after retries; in-memory state remains authoritative"
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_stop_after_success() {
        let calls = AtomicU32::new(0);
        with_retries("update_status", uuid::Uuid::new_v4(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(PersistenceError("database is locked".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_are_swallowed() {
        let calls = AtomicU32::new(0);
        with_retries("persist_initial", uuid::Uuid::new_v4(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PersistenceError("connection refused".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }
}
