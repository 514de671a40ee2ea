//! Consistent JSON error shape: `{"error": "<code>", "detail": "<message>"}`.
//!
//! REST surfaces render it with the HTTP status; the WebSocket surface
//! sends the same object as a frame. That rendering difference is the
//! only per-surface variation the ingress pipeline has.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", detail)
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", detail)
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", detail)
    }

    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", detail)
    }

    pub fn expired(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "expired", detail)
    }

    pub fn invalid_envelope(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_envelope", detail)
    }

    pub fn invalid_signature(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_signature", detail)
    }

    pub fn blocked(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "blocked", detail)
    }

    pub fn reputation_blocked(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "reputation_blocked", detail)
    }

    pub fn sender_mismatch(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "sender_mismatch", detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "error", detail)
    }

    /// The same error as a WebSocket frame.
    pub fn ws_frame(&self) -> Value {
        json!({"error": self.code, "detail": self.detail})
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"error": self.code, "detail": self.detail});
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("internal error: {err:#}");
        ApiError::internal("internal error")
    }
}
