//! Authorization-code-with-PKCE session coordinator
//!
//! Composes the `oauth-pkce` primitives into an explicitly owned session:
//! one `SessionCoordinator` per client instance, with its key store, token
//! endpoint and navigator injected. Nothing here is process-global, so
//! several coordinators (one per tenant, say) coexist in one process.
//!
//! Session lifecycle:
//! 1. `SessionCoordinator::start_sign_in()` stores a PKCE flow and navigates to the authorize endpoint
//! 2. `SessionCoordinator::complete_sign_in()` correlates the callback, redeems the
//!    verifier once, exchanges the code and persists the session record
//! 3. `TokenManager::valid_access_token()` hands out the access token, sharing one
//!    in-flight refresh among all concurrent callers once it nears expiry
//! 4. `RequestDispatcher::send()` attaches the token and retries once after a 401
//! 5. `SessionCoordinator::sign_out()` clears local state first, then navigates to end-session

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
mod metrics;
pub mod navigation;
pub mod tokens;

#[cfg(test)]
mod test_support;

pub use config::{ClientConfig, Endpoints};
pub use coordinator::{AuthState, CallbackParams, SessionCoordinator, SessionInfo, SignInOptions, SignInOutcome};
pub use dispatch::{ApiResponse, RequestDispatcher, RequestSpec};
pub use error::{Error, Result};
pub use navigation::{MemoryHistory, Navigation, Navigator};
pub use tokens::{SessionRecord, TokenManager, TokenStore};
