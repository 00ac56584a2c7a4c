//! Video-composition task endpoints.
//!
//! Query and cancel merge two sources: the persisted row (which outlives the
//! task) and the live in-memory record (authoritative while the worker
//! runs). Ownership failures surface as 404, indistinguishable from unknown
//! ids.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{info, warn};
use utoipa::OpenApi;

use splice_core::repository::TaskRow;
use splice_core::{compose_videos, ProgressRecord, ProgressUpdate, TaskError, TaskId, TaskStatus};

use crate::db::{TaskStore, VideoStore};
use crate::error::ServerError;
use crate::middleware::CurrentUser;
use crate::schemas::composition::{
    available_actions, format_remaining, CancelResponse, CreateCompositionRequest,
    CreateCompositionResponse, OutputFileInfo, TaskDetailResponse, TaskSummary,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(create_task, list_tasks, task_detail, cancel_task),
    components(schemas(
        CreateCompositionRequest,
        CreateCompositionResponse,
        TaskDetailResponse,
        TaskSummary,
        CancelResponse,
        OutputFileInfo,
    )),
)]
pub struct CompositionApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/videos/composition/create", post(create_task))
        .route("/videos/composition", get(list_tasks))
        .route(
            "/videos/composition/{task_id}",
            get(task_detail).delete(cancel_task),
        )
}

#[utoipa::path(
    post,
    path = "/videos/composition/create",
    tag = "composition",
    request_body = CreateCompositionRequest,
    responses(
        (status = 201, description = "Task registered and dispatched", body = CreateCompositionResponse),
        (status = 400, description = "Too few videos, duplicates, or unknown ids"),
        (status = 500, description = "Dispatch failure"),
    )
)]
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<CreateCompositionRequest>,
) -> Result<Response, ServerError> {
    let started = Instant::now();

    if req.video_ids.len() < 2 {
        return Err(ServerError::BadRequest(
            "至少需要选择两个视频进行合成".into(),
        ));
    }
    let missing = state.store.missing_video_ids(&req.video_ids).await?;
    if !missing.is_empty() {
        warn!(user_id, ?missing, "composition request references unknown videos");
        return Err(ServerError::BadRequest("部分视频不存在或已被删除".into()));
    }

    let task_id = state
        .manager
        .register(user_id, req.video_ids.clone(), req.output_filename.clone())
        .await
        .map_err(|e| match e {
            TaskError::InvalidArgument(m) => ServerError::BadRequest(m),
            other => ServerError::Internal(other.to_string()),
        })?;

    if !state.manager.start(task_id, compose_videos).await {
        state
            .manager
            .update_progress(task_id, ProgressUpdate::failed("failed to start worker"))
            .await;
        return Err(ServerError::Internal("启动合成任务失败，请稍后重试".into()));
    }

    let record = state
        .manager
        .query(task_id)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    let response_time_ms = started.elapsed().as_millis() as u64;
    info!(task_id = %task_id, user_id, response_time_ms, "composition task created");

    Ok((
        StatusCode::CREATED,
        Json(CreateCompositionResponse {
            message: "合成任务创建成功，正在后台处理".into(),
            task_id: task_id.to_string(),
            status: record.status.as_str().into(),
            progress: record.progress,
            created_at: record.created_at.to_rfc3339(),
            response_time_ms,
        }),
    )
        .into_response())
}

#[utoipa::path(
    get,
    path = "/videos/composition",
    tag = "composition",
    responses(
        (status = 200, description = "The caller's tasks, newest first", body = Vec<TaskSummary>),
    )
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<TaskSummary>>, ServerError> {
    let rows = state.store.list_tasks_for_user(user_id).await?;
    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        let live = state.manager.query(row.task_id).await.ok();
        summaries.push(TaskSummary {
            task_id: row.task_id.to_string(),
            status: live
                .as_ref()
                .map(|l| l.status)
                .unwrap_or(row.status)
                .as_str()
                .into(),
            progress: live.as_ref().map(|l| l.progress).unwrap_or(row.progress),
            created_at: row.created_at.to_rfc3339(),
            output_filename: row.output_filename,
        });
    }
    Ok(Json(summaries))
}

#[utoipa::path(
    get,
    path = "/videos/composition/{task_id}",
    tag = "composition",
    params(("task_id" = String, Path, description = "Task id returned by create")),
    responses(
        (status = 200, description = "Task progress detail", body = TaskDetailResponse),
        (status = 404, description = "Unknown id, or not owned by the caller"),
    )
)]
pub async fn task_detail(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(task_id): Path<String>,
) -> Result<Json<TaskDetailResponse>, ServerError> {
    let task_id = parse_task_id(&task_id)?;
    let row = state
        .store
        .get_task_for_user(task_id, user_id)
        .await?
        .ok_or_else(not_found)?;
    let live = state.manager.query(task_id).await.ok();
    Ok(Json(build_detail(&state, row, live).await))
}

#[utoipa::path(
    delete,
    path = "/videos/composition/{task_id}",
    tag = "composition",
    params(("task_id" = String, Path, description = "Task id returned by create")),
    responses(
        (status = 200, description = "Cancellation accepted", body = CancelResponse),
        (status = 400, description = "Task already terminal; body carries current_status"),
        (status = 404, description = "Unknown id, or not owned by the caller"),
    )
)]
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(task_id): Path<String>,
) -> Result<Response, ServerError> {
    let task_id = parse_task_id(&task_id)?;
    let row = state
        .store
        .get_task_for_user(task_id, user_id)
        .await?
        .ok_or_else(not_found)?;

    match state.manager.cancel(task_id).await {
        Ok(outcome) => {
            info!(task_id = %task_id, user_id, "composition task cancelled");
            Ok(Json(CancelResponse {
                message: "任务已成功取消".into(),
                task_id: task_id.to_string(),
                status: TaskStatus::Cancelled.as_str().into(),
                cancelled_at: outcome.cancelled_at.to_rfc3339(),
                success: true,
            })
            .into_response())
        }
        Err(TaskError::IllegalState { status }) => Ok(terminal_cancel_response(status)),
        Err(TaskError::NotFound(_)) => {
            // The worker's cleanup has already dropped the live entries (or
            // the process restarted); the stored row decides.
            if row.status.is_terminal() {
                Ok(terminal_cancel_response(row.status))
            } else {
                warn!(task_id = %task_id, status = %row.status, "cancel for a task with no live entry");
                Ok((
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "任务已不在处理队列中，无法取消",
                        "success": false,
                    })),
                )
                    .into_response())
            }
        }
        Err(other) => Err(ServerError::Internal(other.to_string())),
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_task_id(raw: &str) -> Result<TaskId, ServerError> {
    raw.parse().map_err(|_| not_found())
}

fn not_found() -> ServerError {
    ServerError::NotFound("任务不存在或无权访问".into())
}

fn terminal_cancel_response(status: TaskStatus) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": format!("任务已{}，无法取消", status.as_str()),
            "current_status": status.as_str(),
            "message": "只能取消等待中或处理中的任务",
        })),
    )
        .into_response()
}

/// Merge the persisted row with the live record (when present) into the
/// detail body. The live record wins wherever it has data.
async fn build_detail(
    state: &AppState,
    row: TaskRow,
    live: Option<ProgressRecord>,
) -> TaskDetailResponse {
    let status = live.as_ref().map(|l| l.status).unwrap_or(row.status);
    let progress = live.as_ref().map(|l| l.progress).unwrap_or(row.progress);
    let started_at = live.as_ref().and_then(|l| l.started_at).or(row.started_at);
    let completed_at = live
        .as_ref()
        .and_then(|l| l.completed_at)
        .or(row.completed_at);
    let error_message = live
        .as_ref()
        .and_then(|l| l.error_message.clone())
        .or_else(|| row.error_message.clone());
    let current_stage = live.as_ref().and_then(|l| l.current_stage.clone());
    let estimated_time_remaining = live.as_ref().and_then(|l| l.estimated_time_remaining);
    // The live record may carry the artifact before the repository's
    // attach-output write lands; prefer it so a completed status is never
    // seen without its output.
    let output_ref = live
        .as_ref()
        .and_then(|l| l.output_file.clone())
        .or_else(|| row.output_file.clone());

    let mut output_file = None;
    if status == TaskStatus::Completed {
        if let Some(file_ref) = &output_ref {
            let path = state.manager.config().output_root.join(file_ref);
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).ok();
            output_file = Some(OutputFileInfo {
                filename: row.output_filename.clone(),
                file_size: size.unwrap_or(0),
                file_size_mb: (size.unwrap_or(0) as f64 / (1024.0 * 1024.0) * 100.0).round()
                    / 100.0,
                download_url: format!("/api/videos/compose/{}/download/", row.task_id),
                stream_url: format!("/api/videos/compose/{}/stream/", row.task_id),
                file_exists: size.is_some(),
            });
        }
    }

    let actions = available_actions(status, output_file.is_some());
    TaskDetailResponse {
        task_id: row.task_id.to_string(),
        status: status.as_str().into(),
        progress,
        created_at: row.created_at.to_rfc3339(),
        started_at: started_at.map(|t| t.to_rfc3339()),
        completed_at: completed_at.map(|t| t.to_rfc3339()),
        output_filename: row.output_filename,
        error_message,
        video_list: row.video_ids,
        current_stage,
        estimated_time_remaining,
        estimated_time_remaining_formatted: estimated_time_remaining.map(format_remaining),
        output_file,
        available_actions: actions,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn malformed_task_ids_read_as_not_found() {
        assert!(matches!(
            parse_task_id("not-a-uuid"),
            Err(ServerError::NotFound(_))
        ));
        assert!(parse_task_id("0c3f1f9e-9f7a-4e52-9f0e-1a2b3c4d5e6f").is_ok());
    }

    #[test]
    fn cancellable_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
    }
}
