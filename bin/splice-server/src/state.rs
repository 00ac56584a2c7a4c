//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use splice_core::TaskManager;

use crate::config::Config;
use crate::db::sqlite::SqliteStore;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Persistent task / video store.
    pub store: Arc<SqliteStore>,
    /// The composition task engine.
    pub manager: Arc<TaskManager>,
}
