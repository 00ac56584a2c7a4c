//! Caller authentication.
//!
//! Authentication proper is a collaborator outside this service; the routes
//! only need an opaque caller id. Two pieces stand in for the upstream
//! gateway:
//!
//! - an optional shared bearer token (`SPLICE_API_TOKEN`) checked on every
//!   composition route;
//! - the `X-User-Id` header, which the gateway is expected to set after
//!   authenticating the caller.

use axum::body::Body;
use axum::extract::{FromRequestParts, Request};
use axum::http::header::HeaderName;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ServerError;

/// HTTP header carrying the authenticated caller's opaque id.
pub static X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");

/// Shared-token gate for the composition routes. Disabled when
/// `SPLICE_API_TOKEN` is unset.
pub async fn check_api_auth(req: Request<Body>, next: Next) -> Response {
    let expected = std::env::var("SPLICE_API_TOKEN").ok();
    if let Some(expected_token) = expected {
        let provided = req
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match provided {
            Some(token) if token == expected_token => {}
            _ => {
                return (
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({ "error": "unauthorised" })),
                )
                    .into_response();
            }
        }
    }
    next.run(req).await
}

/// Extractor for the authenticated caller's id.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub i64);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(&X_USER_ID)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok())
            .map(CurrentUser)
            .ok_or_else(|| {
                ServerError::Unauthorized("missing or invalid X-User-Id header".into())
            })
    }
}

#[cfg(test)]
mod test {
    #[test]
    fn bearer_prefix_is_stripped() {
        let header = "Bearer sekrit";
        assert_eq!(header.strip_prefix("Bearer "), Some("sekrit"));
        assert_eq!("Basic sekrit".strip_prefix("Bearer "), None);
    }
}
