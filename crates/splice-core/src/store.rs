//! Progress store: the read-optimized projection of live task state.
//!
//! One [`ProgressRecord`] per live task. The map itself carries no lock; all
//! mutation goes through the facade's single write lock so the progress store
//! and the task registry can never disagree about which tasks exist.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::types::{TaskId, TaskStatus};

/// Stage text shown for a task that reached `completed`.
pub const STAGE_COMPLETED: &str = "任务已完成";
/// Stage text shown for a task that reached `failed`.
pub const STAGE_FAILED: &str = "任务执行失败";
/// Stage text shown for a task that reached `cancelled`.
pub const STAGE_CANCELLED: &str = "任务已取消";

/// Snapshot of a task's externally observable progress.
///
/// All fields become visible together: a reader never sees
/// `status == completed` without the matching `output_file`, or
/// `status == failed` without `error_message`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Percentage in `[0, 100]`, monotonically non-decreasing.
    pub progress: u8,
    pub output_file: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Short human-readable description of the worker's current stage.
    pub current_stage: Option<String>,
    /// Estimated seconds until completion; cleared on terminal states.
    pub estimated_time_remaining: Option<u64>,
}

/// Partial update applied to a task's progress state.
///
/// `progress: None` keeps the stored value without triggering the
/// backward-progress clamp warning.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub progress: Option<u8>,
    pub status: Option<TaskStatus>,
    pub output_file: Option<String>,
    pub error_message: Option<String>,
    pub current_stage: Option<String>,
    pub estimated_time_remaining: Option<u64>,
}

impl ProgressUpdate {
    /// Plain progress report with a stage description.
    pub fn report(progress: u8, stage: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            current_stage: Some(stage.into()),
            ..Self::default()
        }
    }

    /// Terminal failure with a user-readable reason.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// In-memory map `task_id → ProgressRecord` (component C1).
#[derive(Debug, Default)]
pub(crate) struct ProgressStore {
    records: HashMap<TaskId, ProgressRecord>,
}

impl ProgressStore {
    /// Insert a fresh record. Returns `false` if the id is already present.
    pub(crate) fn create(&mut self, task_id: TaskId, status: TaskStatus) -> bool {
        if self.records.contains_key(&task_id) {
            return false;
        }
        self.records.insert(
            task_id,
            ProgressRecord {
                task_id,
                status,
                progress: 0,
                output_file: None,
                error_message: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                current_stage: None,
                estimated_time_remaining: None,
            },
        );
        true
    }

    pub(crate) fn get(&self, task_id: &TaskId) -> Option<ProgressRecord> {
        self.records.get(task_id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, task_id: &TaskId) -> bool {
        self.records.contains_key(task_id)
    }

    /// Apply an already-validated update to the record.
    ///
    /// The facade has resolved clamping and transition legality by the time
    /// this runs; this method only mirrors the fields and performs the
    /// terminal-state bookkeeping (timestamps, stage text, ETA clearing).
    pub(crate) fn apply(&mut self, task_id: &TaskId, progress: u8, update: &ProgressUpdate) {
        let Some(record) = self.records.get_mut(task_id) else {
            debug!(task_id = %task_id, "progress update for unknown record");
            return;
        };

        record.progress = progress;
        if let Some(file) = &update.output_file {
            record.output_file = Some(file.clone());
        }
        if let Some(message) = &update.error_message {
            record.error_message = Some(message.clone());
        }
        if let Some(stage) = &update.current_stage {
            record.current_stage = Some(stage.clone());
        }
        if let Some(eta) = update.estimated_time_remaining {
            record.estimated_time_remaining = Some(eta);
        }

        if let Some(status) = update.status {
            record.status = status;
            match status {
                TaskStatus::Processing => {
                    if record.started_at.is_none() {
                        record.started_at = Some(Utc::now());
                    }
                }
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                    record.completed_at = Some(Utc::now());
                    record.estimated_time_remaining = None;
                    record.current_stage = Some(
                        match status {
                            TaskStatus::Completed => STAGE_COMPLETED,
                            TaskStatus::Failed => STAGE_FAILED,
                            _ => STAGE_CANCELLED,
                        }
                        .to_owned(),
                    );
                }
                TaskStatus::Pending => {}
            }
        }
    }

    /// Remove a record; silently does nothing when absent.
    pub(crate) fn remove(&mut self, task_id: &TaskId) {
        if self.records.remove(task_id).is_some() {
            debug!(task_id = %task_id, "progress record removed");
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
