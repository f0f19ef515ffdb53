//! Protected API forwarding
//!
//! `/api/*` requests are re-issued against the upstream API through the
//! session's `RequestDispatcher`, which attaches the bearer token and owns
//! the single retry after a `401`. The browser never sees the access token.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use session::{RequestDispatcher, RequestSpec};
use tracing::{instrument, warn};

use crate::error::{ApiError, error_response};

/// Path prefix routed to the upstream API
pub const API_PREFIX: &str = "/api";

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Request headers passed through to the upstream API
const FORWARDED_HEADERS: &[&str] = &["accept", "accept-language", "x-request-id"];

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<RequestDispatcher>,
    pub upstream_url: String,
}

/// Whether `path` belongs to the API prefix (`/api` or `/api/...`).
pub fn is_api_path(path: &str) -> bool {
    path.strip_prefix(API_PREFIX)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Upstream URL for an inbound `/api/...` path and query.
pub fn upstream_target(upstream_url: &str, path: &str, query: Option<&str>) -> String {
    let rest = path.strip_prefix(API_PREFIX).unwrap_or(path);
    let mut target = format!("{}{}", upstream_url.trim_end_matches('/'), rest);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }
    target
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn forward(state: &ApiState, request: Request<Body>) -> Response {
    let target = upstream_target(
        &state.upstream_url,
        request.uri().path(),
        request.uri().query(),
    );
    let mut req = RequestSpec::new(request.method().clone(), target);
    for name in FORWARDED_HEADERS {
        if let Some(value) = request.headers().get(*name).and_then(|v| v.to_str().ok()) {
            req = req.with_header(*name, value);
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "validation_error",
                &format!("invalid request body: {e}"),
            );
        }
    };
    if !body.is_empty() {
        match serde_json::from_slice(&body) {
            Ok(json) => req.body = Some(json),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    &format!("request body must be JSON: {e}"),
                );
            }
        }
    }

    match state.dispatcher.send(&req).await {
        Ok(upstream) => {
            crate::metrics::record_api_request(upstream.status);
            let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = upstream
                .header("content-type")
                .and_then(|v| HeaderValue::from_str(v).ok());
            let mut response = (status, upstream.body).into_response();
            if let Some(content_type) = content_type {
                response
                    .headers_mut()
                    .insert(axum::http::header::CONTENT_TYPE, content_type);
            }
            response
        }
        Err(e) => {
            warn!(code = e.code(), error = %e, "api request failed");
            let error = ApiError(e);
            crate::metrics::record_api_request(error.status().as_u16());
            error.into_response()
        }
    }
}
