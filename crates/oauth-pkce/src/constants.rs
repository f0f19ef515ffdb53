//! Storage namespaces and OAuth protocol constants
//!
//! Flow records live under `FLOW_NAMESPACE` with a fixed-width numeric suffix
//! per attempt. The session record lives under a single well-known key.

/// Namespace for in-flight PKCE flow records
pub const FLOW_NAMESPACE: &str = "pkce_code_verifier";

/// Namespace for the persisted session record
pub const SESSION_NAMESPACE: &str = "session_data";

/// Suffix of the single session record key
pub const SESSION_KEY: &str = "current";

/// Flow key suffixes are zero-padded to this width so that lexicographic
/// order matches numeric order (u64::MAX has 20 digits).
pub const FLOW_KEY_WIDTH: usize = 20;

/// Marker separating caller state from the flow suffix inside `state`
pub const STATE_FLOW_MARKER: &str = "request_";

/// PKCE transform advertised to the authorization server
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// Default authorize path relative to the tenant base URL
pub const AUTHORIZE_PATH: &str = "/oauth2/authorize";

/// Default token path relative to the tenant base URL
pub const TOKEN_PATH: &str = "/oauth2/token";

/// Default end-session path relative to the tenant base URL
pub const END_SESSION_PATH: &str = "/oidc/logout";

/// Scope requested when the caller configures none
pub const DEFAULT_SCOPE: &str = "openid";
