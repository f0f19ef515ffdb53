//! HTTP mapping for coordinator errors
//!
//! Every handler failure becomes a JSON body
//! `{"error":{"type":"<code>","message":"...","request_id":"req_..."}}`
//! where `type` is the stable `session::Error::code()`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// A coordinator error on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub session::Error);

impl From<session::Error> for ApiError {
    fn from(err: session::Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use session::Error;
        match &self.0 {
            Error::Validation(_) | Error::Correlation(_) | Error::FlowNotFound(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::TokenExchange(_) | Error::SessionExpired(_) | Error::Authentication(_) => {
                StatusCode::UNAUTHORIZED
            }
            Error::Network(_) => StatusCode::BAD_GATEWAY,
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error response with a fresh request id.
pub fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.0.code(), &self.0.to_string())
    }
}
