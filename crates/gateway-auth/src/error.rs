//! Error types for credential operations

/// Errors from credential storage, refresh, and login operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("authorization callback state mismatch")]
    StateMismatch,

    #[error("authorization timed out after {0}s")]
    LoginTimeout(u64),
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;
