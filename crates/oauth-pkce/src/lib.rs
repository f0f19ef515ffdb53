//! PKCE authorization-code primitives
//!
//! Leaf building blocks for the sign-in session coordinator: URL-safe
//! encoding, the correlation key store that survives a redirect round-trip,
//! state derivation and flow correlation, PKCE verifier lifecycle, and the
//! token endpoint client. This crate has no notion of a "current session";
//! the `session` crate composes these pieces into the coordinator.
//!
//! Flow lifecycle:
//! 1. `PkceManager::begin_challenge()` allocates a flow key and stores the verifier
//! 2. `state::derive_state()` embeds the flow key suffix into the state parameter
//! 3. `AuthorizationRequest::to_url()` builds the redirect to the authorize endpoint
//! 4. On callback, `state::extract_flow_suffix()` / `state::resolve_latest_flow()`
//!    locate the flow, and `PkceManager::consume_verifier()` redeems it once
//! 5. `TokenEndpoint::exchange_code()` trades code + verifier for tokens

pub mod authorize;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod pkce;
pub mod state;
pub mod store;
pub mod token;

pub use authorize::AuthorizationRequest;
pub use constants::*;
pub use error::{Error, Result};
pub use pkce::{FlowRecord, PkceChallenge, PkceManager, compute_challenge, generate_verifier};
pub use store::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use token::{HttpTokenEndpoint, TokenEndpoint, TokenFuture, TokenResponse};

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
