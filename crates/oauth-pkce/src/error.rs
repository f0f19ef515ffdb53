//! Error types for PKCE flow and token endpoint operations

/// Errors from flow storage, encoding, and token endpoint calls.
///
/// Payloads are plain strings so the error is `Clone` and can be handed to
/// every waiter of a shared refresh.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("decoding failed: {0}")]
    Decoding(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
}

/// Result alias for PKCE operations.
pub type Result<T> = std::result::Result<T, Error>;
