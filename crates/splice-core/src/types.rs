use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a composition task (v4 UUID, printed hyphenated).
pub type TaskId = uuid::Uuid;

/// Lifecycle state of a composition task.
///
/// `Completed`, `Failed` and `Cancelled` are sinks: once a task reaches one
/// of them, neither its status nor its progress changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Registered but not yet dispatched to a worker.
    Pending,
    /// A worker is executing the composition.
    Processing,
    /// The output artifact is ready; `output_file` is set.
    Completed,
    /// The worker gave up; `error_message` is set.
    Failed,
    /// The task was cancelled before producing an output.
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the task-manager facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The caller passed an unusable argument (too few videos, duplicates).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced task does not exist (or is no longer held in memory).
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The operation is not legal for the task's current status.
    #[error("task is {status}, operation not allowed")]
    IllegalState { status: TaskStatus },
}

/// Unrecoverable errors inside a composition worker.
///
/// The supervisor converts these into the task's terminal `failed` state;
/// the message must be readable by an end user, internal detail goes to the
/// log at the point of failure.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The task's inputs cannot produce a composition.
    #[error("{0}")]
    InvalidInput(String),

    /// The encoder reported an error or exited abnormally.
    #[error("encoder failed: {0}")]
    Encoder(String),

    /// Filesystem trouble while staging or writing the output.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// The message recorded on the task record.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    pub message: String,
    /// Status at the time the request was handled. For a `processing` task
    /// this is still `processing`; the worker writes the terminal
    /// `cancelled` transition at its next poll point.
    pub status: TaskStatus,
    pub cancelled_at: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }
}
