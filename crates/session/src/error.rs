//! Errors surfaced at the coordinator boundary
//!
//! Every failure from storage, the token endpoint or the network is mapped
//! into one of these variants before it leaves the crate. Each variant has a
//! stable `code()` for callers that branch on the failure kind.

/// Session coordinator errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed configuration or request input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Callback state did not match any pending sign-in flow.
    #[error("correlation error: {0}")]
    Correlation(String),

    /// PKCE verifier already consumed, expired, or never stored.
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// Token endpoint rejected the code exchange.
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// No usable session: refresh rejected, or nobody signed in.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Request still rejected with 401 after a refresh.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::Correlation(_) => "correlation_error",
            Error::FlowNotFound(_) => "flow_not_found",
            Error::TokenExchange(_) => "token_exchange_error",
            Error::SessionExpired(_) => "session_expired",
            Error::Network(_) => "network_error",
            Error::Authentication(_) => "authentication_error",
            Error::Storage(_) => "storage_error",
        }
    }

    /// Whether the only recovery is to start a new sign-in.
    pub fn requires_sign_in(&self) -> bool {
        matches!(
            self,
            Error::Correlation(_)
                | Error::FlowNotFound(_)
                | Error::TokenExchange(_)
                | Error::SessionExpired(_)
                | Error::Authentication(_)
        )
    }
}

impl From<oauth_pkce::Error> for Error {
    fn from(err: oauth_pkce::Error) -> Self {
        use oauth_pkce::Error as Pkce;
        match err {
            Pkce::Decoding(msg) | Pkce::Config(msg) => Error::Validation(msg),
            Pkce::Storage(msg) => Error::Storage(msg),
            Pkce::FlowNotFound(msg) => Error::FlowNotFound(msg),
            Pkce::Http(msg) => Error::Network(msg),
            Pkce::TokenExchange(msg) => Error::TokenExchange(msg),
            Pkce::InvalidCredentials(msg) => Error::SessionExpired(msg),
        }
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
