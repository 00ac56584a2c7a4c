//! SQLite implementation of the server stores and of splice-core's
//! repository ports.
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are run automatically
//! on startup via [`SqliteStore::connect`].
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves the path **at compile time**
//! relative to `CARGO_MANIFEST_DIR` (the crate root), so the directory is
//! embedded into the binary. The database file location is determined at
//! runtime by the `SPLICE_DATABASE_URL` environment variable.
//!
//! # Queries
//!
//! The `sqlx::query` (runtime-verified) form is used deliberately so that no
//! `DATABASE_URL` environment variable is needed at compile time.
//!
//! # Connections
//!
//! Every operation checks a connection out of the pool for its own duration.
//! Workers call these methods through splice-core's ports, so no connection
//! object ever leaks into (or across) a worker's execution scope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

use splice_core::repository::{
    PersistenceError, StatusPatch, TaskRepository, TaskRow, VideoMeta, VideoRepository,
};
use splice_core::{TaskId, TaskStatus};

use super::{TaskStore, VideoStore};

/// SQLite-backed task / video store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending
    /// migrations.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(url).await?;
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

/// The `tasks` columns, in select order.
type TaskRowTuple = (
    String,         // task_id
    i64,            // user_id
    String,         // video_list (JSON array)
    String,         // status
    i64,            // progress
    Option<String>, // output_file
    String,         // output_filename
    Option<i64>,    // total_duration_secs
    Option<String>, // error_message
    String,         // created_at
    Option<String>, // started_at
    Option<String>, // completed_at
);

const TASK_COLUMNS: &str = "task_id, user_id, video_list, status, progress, output_file, \
     output_filename, total_duration_secs, error_message, created_at, started_at, completed_at";

fn row_to_task(row: TaskRowTuple, requested: Option<TaskId>) -> TaskRow {
    let (
        task_id,
        user_id,
        video_list,
        status,
        progress,
        output_file,
        output_filename,
        total_duration_secs,
        error_message,
        created_at,
        started_at,
        completed_at,
    ) = row;

    let parsed_id = task_id.parse::<Uuid>().unwrap_or_else(|e| {
        warn!(raw = %task_id, error = %e, "failed to parse task_id column");
        requested.unwrap_or(Uuid::nil())
    });
    let parsed_status = status.parse::<TaskStatus>().unwrap_or_else(|e| {
        warn!(raw = %status, error = %e, "failed to parse task status; treating as failed");
        TaskStatus::Failed
    });
    let video_ids: Vec<i64> = serde_json::from_str(&video_list).unwrap_or_else(|e| {
        warn!(raw = %video_list, error = %e, "failed to parse video_list column");
        Vec::new()
    });

    TaskRow {
        task_id: parsed_id,
        user_id,
        video_ids,
        status: parsed_status,
        progress: progress.clamp(0, 100) as u8,
        output_file,
        output_filename,
        total_duration_secs,
        error_message,
        created_at: parse_datetime(&created_at, "created_at"),
        started_at: started_at.as_deref().map(|s| parse_datetime(s, "started_at")),
        completed_at: completed_at
            .as_deref()
            .map(|s| parse_datetime(s, "completed_at")),
    }
}

fn parse_datetime(raw: &str, field: &'static str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        warn!(raw = %raw, field, error = %e, "failed to parse timestamp column; using now");
        Utc::now()
    })
}

fn persist_err(e: sqlx::Error) -> PersistenceError {
    PersistenceError(e.to_string())
}

// ── TaskStore ─────────────────────────────────────────────────────────────────

impl TaskStore for SqliteStore {
    async fn list_tasks_for_user(&self, user_id: i64) -> Result<Vec<TaskRow>, sqlx::Error> {
        let rows: Vec<TaskRowTuple> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| row_to_task(r, None)).collect())
    }

    async fn get_task_for_user(
        &self,
        task_id: TaskId,
        user_id: i64,
    ) -> Result<Option<TaskRow>, sqlx::Error> {
        let row: Option<TaskRowTuple> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1 AND user_id = ?2"
        ))
        .bind(task_id.to_string())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_task(r, Some(task_id))))
    }

    async fn fail_inflight_tasks(&self) -> Result<u64, sqlx::Error> {
        let completed_at = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', error_message = 'server restarted', \
             completed_at = ?1 WHERE status IN ('pending', 'processing')",
        )
        .bind(&completed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ── VideoStore ────────────────────────────────────────────────────────────────

impl VideoStore for SqliteStore {
    async fn missing_video_ids(&self, video_ids: &[i64]) -> Result<Vec<i64>, sqlx::Error> {
        let mut missing = Vec::new();
        for &video_id in video_ids {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM videos WHERE id = ?1 AND is_active = 1")
                    .bind(video_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if row.is_none() {
                missing.push(video_id);
            }
        }
        Ok(missing)
    }
}

// ── splice-core repository ports ─────────────────────────────────────────────

#[async_trait]
impl TaskRepository for SqliteStore {
    async fn persist_initial(&self, row: &TaskRow) -> Result<(), PersistenceError> {
        let video_list =
            serde_json::to_string(&row.video_ids).map_err(|e| PersistenceError(e.to_string()))?;
        let mut tx = self.pool.begin().await.map_err(persist_err)?;
        sqlx::query(
            "INSERT INTO tasks (task_id, user_id, video_list, status, progress, output_file, \
             output_filename, total_duration_secs, error_message, created_at, started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(row.task_id.to_string())
        .bind(row.user_id)
        .bind(&video_list)
        .bind(row.status.as_str())
        .bind(i64::from(row.progress))
        .bind(&row.output_file)
        .bind(&row.output_filename)
        .bind(row.total_duration_secs)
        .bind(&row.error_message)
        .bind(row.created_at.to_rfc3339())
        .bind(row.started_at.map(|t| t.to_rfc3339()))
        .bind(row.completed_at.map(|t| t.to_rfc3339()))
        .execute(&mut *tx)
        .await
        .map_err(persist_err)?;

        for (order_index, video_id) in row.video_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO task_selections (task_id, video_id, order_index) VALUES (?1, ?2, ?3)",
            )
            .bind(row.task_id.to_string())
            .bind(video_id)
            .bind(order_index as i64)
            .execute(&mut *tx)
            .await
            .map_err(persist_err)?;
        }

        tx.commit().await.map_err(persist_err)
    }

    async fn update_status(
        &self,
        task_id: TaskId,
        patch: &StatusPatch,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE tasks SET \
               status        = COALESCE(?1, status), \
               progress      = COALESCE(?2, progress), \
               error_message = COALESCE(?3, error_message), \
               started_at    = COALESCE(?4, started_at), \
               completed_at  = COALESCE(?5, completed_at) \
             WHERE task_id = ?6",
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.progress.map(i64::from))
        .bind(&patch.error_message)
        .bind(patch.started_at.map(|t| t.to_rfc3339()))
        .bind(patch.completed_at.map(|t| t.to_rfc3339()))
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(persist_err)?;
        Ok(())
    }

    async fn attach_output(
        &self,
        task_id: TaskId,
        file_ref: &str,
        total_duration_secs: Option<i64>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE tasks SET output_file = ?1, total_duration_secs = ?2 WHERE task_id = ?3",
        )
        .bind(file_ref)
        .bind(total_duration_secs)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(persist_err)?;
        Ok(())
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<TaskRow>, PersistenceError> {
        let row: Option<TaskRowTuple> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"
        ))
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(persist_err)?;
        Ok(row.map(|r| row_to_task(r, Some(task_id))))
    }
}

#[async_trait]
impl VideoRepository for SqliteStore {
    async fn get(&self, video_id: i64) -> Result<Option<VideoMeta>, PersistenceError> {
        let row: Option<(i64, String, String, Option<f64>)> = sqlx::query_as(
            "SELECT id, title, file_path, duration_secs FROM videos \
             WHERE id = ?1 AND is_active = 1",
        )
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(persist_err)?;
        Ok(row.map(|(id, title, file_path, duration_secs)| VideoMeta {
            id,
            title,
            file_path: file_path.into(),
            duration_secs,
        }))
    }
}
