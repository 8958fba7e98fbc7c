//! Axum middleware that charges one point per request against the client IP.
//!
//! The client key is taken from `x-real-ip`, then the first non-empty
//! `x-forwarded-for` entry, then the socket address from `ConnectInfo`, and
//! finally the literal `"unknown"`. Over-quota clients get `429 Too Many
//! Requests` with a `Retry-After` header.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::debug;

use super::rate_limiter::{RateLimiter, Rejection};

/// Resolve the rate-limit key for a request.
pub fn client_key(request: &Request<Body>) -> String {
    let headers = request.headers();
    let from_headers = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split(',').map(str::trim).find(|ip| !ip.is_empty()))
        });

    if let Some(ip) = from_headers {
        return ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware for `axum::middleware::from_fn_with_state`.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&request);
    match limiter.consume(&key, 1) {
        Ok(_) => next.run(request).await,
        Err(rejection) => {
            debug!(key = %key, path = %request.uri().path(), "Rejecting over-quota request");
            too_many_requests(rejection)
        }
    }
}

fn too_many_requests(rejection: Rejection) -> Response {
    let retry_secs = rejection.retry_after.as_secs_f64().ceil() as u64;
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_secs.to_string())],
        Json(serde_json::json!({
            "error": "Too Many Requests",
            "message": "Please try again later",
        })),
    )
        .into_response()
}

// ============================================================================
// Tests
// ============================================================================
