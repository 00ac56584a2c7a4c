//! Database abstraction layer.
//!
//! [`TaskStore`] and [`VideoStore`] define the server-side query interface;
//! the default implementation is [`sqlite::SqliteStore`], which also
//! implements splice-core's repository ports. To swap to another database,
//! implement these traits for a new type and change the concrete type in
//! [`crate::state::AppState`].
//!
//! All trait methods use `impl Future` in their signatures (stable since
//! Rust 1.75) so no extra `async-trait` crate is required here.

pub mod sqlite;

use splice_core::repository::TaskRow;
use splice_core::TaskId;

/// Server-side queries over the persisted task rows.
pub trait TaskStore: Send + Sync + 'static {
    /// All tasks owned by `user_id`, newest first.
    fn list_tasks_for_user(
        &self,
        user_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<TaskRow>, sqlx::Error>> + Send;

    /// One task, only if owned by `user_id`. Unknown and foreign ids are
    /// indistinguishable to the caller.
    fn get_task_for_user(
        &self,
        task_id: TaskId,
        user_id: i64,
    ) -> impl std::future::Future<Output = Result<Option<TaskRow>, sqlx::Error>> + Send;

    /// Mark every row still `pending`/`processing` as failed. Run once at
    /// startup: tasks in flight at shutdown are lost and the rows must not
    /// pretend otherwise. Returns the number of rows touched.
    fn fail_inflight_tasks(
        &self,
    ) -> impl std::future::Future<Output = Result<u64, sqlx::Error>> + Send;
}

/// Server-side queries over the source-video catalog.
pub trait VideoStore: Send + Sync + 'static {
    /// The subset of `video_ids` that do not resolve to an active video.
    fn missing_video_ids(
        &self,
        video_ids: &[i64],
    ) -> impl std::future::Future<Output = Result<Vec<i64>, sqlx::Error>> + Send;
}
