//! Translation error types

use thiserror::Error;

/// Errors from request/response rewriting.
///
/// Streaming per-frame parse failures are not represented here: the
/// stream translator skips bad frames locally and keeps going.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed upstream response: {0}")]
    MalformedUpstream(String),

    #[error("malformed request body: {0}")]
    MalformedRequest(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias for translation operations.
pub type Result<T> = std::result::Result<T, Error>;
