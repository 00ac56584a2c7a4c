//! Task registry: the authoritative map of live tasks (component C2).
//!
//! A [`TaskHandle`] owns everything the facade needs to manage one task:
//! ownership metadata, the current status/progress pair, the write-once
//! cancel signal, and the worker's abort handle once dispatched.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::types::{TaskId, TaskStatus};

/// Live state of a single task, owned by the registry.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    pub task_id: TaskId,
    pub user_id: i64,
    /// Ordered source-video ids; length ≥ 2, no duplicates.
    pub video_ids: Vec<i64>,
    pub status: TaskStatus,
    pub progress: u8,
    pub output_file: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Write-once cancellation signal; workers subscribe and poll.
    pub cancel_tx: watch::Sender<bool>,
    /// Present once a worker has been dispatched (invariant I6).
    pub worker: Option<tokio::task::AbortHandle>,
    /// Last moment `progress` strictly increased; read by the stale sweeper.
    pub last_progress_at: DateTime<Utc>,
}

impl TaskHandle {
    pub(crate) fn new(task_id: TaskId, user_id: i64, video_ids: Vec<i64>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let now = Utc::now();
        Self {
            task_id,
            user_id,
            video_ids,
            status: TaskStatus::Pending,
            progress: 0,
            output_file: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            cancel_tx,
            worker: None,
            last_progress_at: now,
        }
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Set the cancel signal. Once set it is never unset.
    pub(crate) fn signal_cancel(&self) {
        self.cancel_tx.send_replace(true);
    }
}

/// Legal status transitions made by the facade. Everything else is a
/// logged no-op.
///
/// `pending → failed` covers dispatch failures ("failed to start worker")
/// and the restart failover; all other edges are the task state machine.
pub(crate) fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Pending, Cancelled)
            | (Pending, Failed)
            | (Processing, Completed)
            | (Processing, Failed)
            | (Processing, Cancelled)
    )
}

/// In-memory map `task_id → TaskHandle`.
#[derive(Debug, Default)]
pub(crate) struct TaskRegistry {
    tasks: HashMap<TaskId, TaskHandle>,
}

impl TaskRegistry {
    /// Insert a fresh handle. Returns `false` if the id is already present.
    pub(crate) fn create(&mut self, handle: TaskHandle) -> bool {
        if self.tasks.contains_key(&handle.task_id) {
            return false;
        }
        self.tasks.insert(handle.task_id, handle);
        true
    }

    pub(crate) fn get(&self, task_id: &TaskId) -> Option<&TaskHandle> {
        self.tasks.get(task_id)
    }

    pub(crate) fn get_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskHandle> {
        self.tasks.get_mut(task_id)
    }

    pub(crate) fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Ids of all tasks currently in the given status.
    pub(crate) fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.task_id)
            .collect()
    }

    /// Remove a handle; silently does nothing when absent.
    pub(crate) fn remove(&mut self, task_id: &TaskId) {
        if self.tasks.remove(task_id).is_some() {
            debug!(task_id = %task_id, "task handle removed");
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}
