//! Request / response bodies for the composition endpoints.

use serde::{Deserialize, Serialize};
use splice_core::TaskStatus;
use utoipa::ToSchema;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateCompositionRequest {
    /// Ordered source-video ids; at least two, no duplicates.
    pub video_ids: Vec<i64>,
    /// Optional name for the output artifact.
    pub output_filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CreateCompositionResponse {
    pub message: String,
    pub task_id: String,
    pub status: String,
    pub progress: u8,
    pub created_at: String,
    pub response_time_ms: u64,
}

/// Output-artifact details, present once the task has completed.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OutputFileInfo {
    pub filename: String,
    pub file_size: u64,
    pub file_size_mb: f64,
    pub download_url: String,
    pub stream_url: String,
    pub file_exists: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskDetailResponse {
    pub task_id: String,
    pub status: String,
    pub progress: u8,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub output_filename: String,
    pub error_message: Option<String>,
    pub video_list: Vec<i64>,
    pub current_stage: Option<String>,
    pub estimated_time_remaining: Option<u64>,
    pub estimated_time_remaining_formatted: Option<String>,
    pub output_file: Option<OutputFileInfo>,
    pub available_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskSummary {
    pub task_id: String,
    pub status: String,
    pub progress: u8,
    pub created_at: String,
    pub output_filename: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CancelResponse {
    pub message: String,
    pub task_id: String,
    pub status: String,
    pub cancelled_at: String,
    pub success: bool,
}

/// Human-readable rendering of an ETA in seconds.
pub fn format_remaining(seconds: u64) -> String {
    if seconds < 60 {
        format!("{seconds}秒")
    } else if seconds < 3600 {
        format!("{}分{}秒", seconds / 60, seconds % 60)
    } else {
        format!("{}小时{}分", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Actions the caller may take next, shown verbatim in responses.
pub fn available_actions(status: TaskStatus, has_output: bool) -> Vec<String> {
    let mut actions = Vec::new();
    if matches!(status, TaskStatus::Pending | TaskStatus::Processing) {
        actions.push("cancel".to_owned());
    }
    if status == TaskStatus::Completed && has_output {
        actions.push("download".to_owned());
        actions.push("stream".to_owned());
    }
    actions
}
