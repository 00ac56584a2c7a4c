//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Optional Swagger UI / OpenAPI spec endpoint (disable with `SPLICE_ENABLE_SWAGGER=false`)
//! - Health / heartbeat route
//! - The `/videos/composition` task routes (behind the bearer gate)

mod composition;
mod health;
pub mod doc;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{check_api_auth, trace_requests};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    // ── CORS ─────────────────────────────────────────────────────────────────
    // Default allows all origins. In production, restrict via SPLICE_CORS_ORIGINS.
    let cors = if let Some(origins_str) = &state.config.cors_allowed_origins {
        let origins: Vec<axum::http::HeaderValue> = origins_str
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if origins.is_empty() {
            CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
        } else {
            CorsLayer::new()
                .allow_origin(origins)
                .allow_headers(Any)
                .allow_methods(Any)
        }
    } else {
        CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
    };

    let api_router = Router::new()
        .merge(health::router())
        .merge(composition::router().layer(axum::middleware::from_fn(check_api_auth)));

    let mut app = Router::new().merge(api_router);

    // ── Swagger UI ────────────────────────────────────────────────────────────
    // Enabled by default; disable with SPLICE_ENABLE_SWAGGER=false in
    // production to avoid exposing the API structure.
    let api_doc = doc::get_docs();

    if state.config.enable_swagger {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api_doc));
    }

    app
        // Outermost layers execute first on the way in.
        .layer(axum::middleware::from_fn(trace_requests))
        .layer(cors)
        .with_state(state)
}
