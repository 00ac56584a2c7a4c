//! Background sweeper for stalled tasks.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::manager::TaskManager;

/// Spawn the stale-task sweeper loop.
///
/// Every `stale_sweep_interval` the manager fails any `processing` task whose
/// progress has not increased within `worker_timeout` and signals its worker
/// to stop. The handle can be aborted on shutdown.
pub fn spawn_sweeper(manager: Arc<TaskManager>) -> JoinHandle<()> {
    let interval = manager.config().stale_sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh process does
        // not sweep before any task had a chance to report.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("stale-task sweep");
            manager.sweep_stale().await;
        }
    })
}
