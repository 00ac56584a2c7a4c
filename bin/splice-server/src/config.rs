//! Server configuration, loaded from environment variables at startup.
//!
//! Engine tunables (`MAX_CONCURRENT_WORKERS`, `WORKER_TIMEOUT_SECONDS`,
//! `OUTPUT_ROOT`, `STALE_SWEEP_INTERVAL_SECONDS`) are read separately by
//! [`splice_core::ManagerConfig::from_env`].

/// Runtime configuration for splice-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// SQLite database URL (default: `"sqlite://splice.db?mode=rwc"`).
    ///
    /// The path in a `sqlite://` URL is relative to the **current working
    /// directory** of the server process at startup. For predictable
    /// behaviour in production, use an absolute path, e.g.
    /// `SPLICE_DATABASE_URL=sqlite:///var/lib/splice/splice.db`.
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// When `true`, serve the Swagger UI at `/swagger-ui` and the OpenAPI
    /// spec at `/api-docs/openapi.json`. Set `SPLICE_ENABLE_SWAGGER=false`
    /// to disable in production.
    pub enable_swagger: bool,

    /// Comma-separated list of allowed CORS origins. When `None` (default),
    /// all origins are allowed (`*`).
    pub cors_allowed_origins: Option<String>,

    /// Optional shared bearer token required on the composition routes. Set
    /// `SPLICE_API_TOKEN=<secret>` to require
    /// `Authorization: Bearer <secret>`. When `None`, the gate is disabled
    /// and only the caller-identity header is checked.
    pub api_token: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("SPLICE_BIND", "0.0.0.0:3000"),
            database_url: env_or("SPLICE_DATABASE_URL", "sqlite://splice.db?mode=rwc"),
            log_level: env_or("SPLICE_LOG", "info"),
            log_json: std::env::var("SPLICE_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            enable_swagger: std::env::var("SPLICE_ENABLE_SWAGGER")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            cors_allowed_origins: std::env::var("SPLICE_CORS_ORIGINS").ok(),
            api_token: std::env::var("SPLICE_API_TOKEN").ok(),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}
