//! Gateway error taxonomy
//!
//! Per-request failures map to JSON error responses in the shape
//! `{"error":{"type":...,"message":...,"request_id":"req_..."}}`.
//! Collaborator failures (storage, notification) are logged by the
//! orchestrator and never reach the client.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// No usable credential resolved. The request proceeds
    /// unauthenticated, so this variant only surfaces when a mapped
    /// locator points at a missing or malformed record.
    #[error("no usable credential: {0}")]
    CredentialUnavailable(String),

    #[error("credential refresh failed: {0}")]
    CredentialRefreshFailed(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after: Duration },

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("upstream timeout after {0}s")]
    UpstreamTimeout(u64),

    #[error("translation failed: {0}")]
    TranslationError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::CredentialUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::CredentialRefreshFailed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::TranslationError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable discriminator for the JSON error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::CredentialUnavailable(_) => "credential_unavailable",
            GatewayError::CredentialRefreshFailed(_) => "credential_refresh_failed",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::UpstreamError(_) => "upstream_error",
            GatewayError::UpstreamTimeout(_) => "upstream_timeout",
            GatewayError::TranslationError(_) => "translation_error",
            GatewayError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Render as the client-facing JSON error response. Rate-limit
    /// rejections additionally carry a `retry-after` header in whole
    /// seconds, rounded up so the client never retries early.
    pub fn into_response(self, request_id: &str) -> Response {
        let mut response = error_response(
            self.status(),
            self.error_type(),
            &self.to_string(),
            request_id,
        );
        if let GatewayError::RateLimitExceeded { retry_after } = self {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

/// JSON error response: {"error":{"type":...,"message":...,"request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
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
