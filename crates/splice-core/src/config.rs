//! Engine configuration, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the task manager, the worker pool and the stale sweeper.
///
/// Every field has a default so the engine works without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Cap on simultaneously active workers; `0` means unbounded.
    pub max_concurrent_workers: usize,

    /// A `processing` task whose progress has not increased for this long is
    /// failed with "task timeout" and its worker is signalled to stop.
    pub worker_timeout: Duration,

    /// Base directory for output artifacts and per-task scratch space.
    pub output_root: PathBuf,

    /// How often the stale-task sweeper runs.
    pub stale_sweep_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 0,
            worker_timeout: Duration::from_secs(7200),
            output_root: PathBuf::from("media"),
            stale_sweep_interval: Duration::from_secs(600),
        }
    }
}

impl ManagerConfig {
    /// Build the config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_workers: parse_env(
                "MAX_CONCURRENT_WORKERS",
                defaults.max_concurrent_workers,
            ),
            worker_timeout: Duration::from_secs(parse_env(
                "WORKER_TIMEOUT_SECONDS",
                defaults.worker_timeout.as_secs(),
            )),
            output_root: std::env::var("OUTPUT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_root),
            stale_sweep_interval: Duration::from_secs(parse_env(
                "STALE_SWEEP_INTERVAL_SECONDS",
                defaults.stale_sweep_interval.as_secs(),
            )),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
