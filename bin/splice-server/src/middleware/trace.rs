//! Per-request tracing.
//!
//! Every request runs inside a span carrying a trace id, so log lines from
//! the handlers and the composition engine can be correlated with a single
//! HTTP call. The id is taken from the caller's `X-Trace-Id` header when it
//! parses as a UUID, otherwise freshly assigned, and is echoed back on the
//! response.

use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// HTTP header carrying the per-request trace ID.
pub static X_TRACE_ID: HeaderName = HeaderName::from_static("x-trace-id");

/// Span + trace-id middleware, applied to the whole router via
/// `axum::middleware::from_fn`.
pub async fn trace_requests(mut req: Request<Body>, next: Next) -> Response {
    let trace_id = inherited_trace_id(req.headers()).unwrap_or_else(Uuid::new_v4);
    let header_value = HeaderValue::from_str(&trace_id.to_string())
        .expect("a hyphenated uuid is a valid header value");
    req.headers_mut()
        .insert(X_TRACE_ID.clone(), header_value.clone());

    let span = info_span!(
        "request",
        trace_id = %trace_id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let started = Instant::now();

    async move {
        let mut response = next.run(req).await;
        info!(
            status = response.status().as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "request handled"
        );
        response.headers_mut().insert(X_TRACE_ID.clone(), header_value);
        response
    }
    .instrument(span)
    .await
}

fn inherited_trace_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(&X_TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uuids_are_valid_header_values() {
        let id = Uuid::new_v4();
        assert!(HeaderValue::from_str(&id.to_string()).is_ok());
    }

    #[test]
    fn garbage_trace_headers_are_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(X_TRACE_ID.clone(), HeaderValue::from_static("not-a-uuid"));
        assert_eq!(inherited_trace_id(&headers), None);

        let id = Uuid::new_v4();
        headers.insert(
            X_TRACE_ID.clone(),
            HeaderValue::from_str(&id.to_string()).unwrap(),
        );
        assert_eq!(inherited_trace_id(&headers), Some(id));
    }
}
