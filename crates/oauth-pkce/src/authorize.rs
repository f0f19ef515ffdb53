//! Authorization request construction
//!
//! Builds the redirect URL for the authorize endpoint with the standard
//! authorization-code-with-PKCE parameters. The request is transient: it is
//! never persisted, only navigated to.

use url::Url;

use crate::constants::CODE_CHALLENGE_METHOD;
use crate::error::{Error, Result};

/// Parameters for one redirect to the authorize endpoint.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorize_endpoint: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: String,
    pub state: String,
    /// Additional query parameters (`prompt`, `login_hint`, ...)
    pub extra_params: Vec<(String, String)>,
}

impl AuthorizationRequest {
    /// Render the full authorization URL. Values are percent-encoded.
    pub fn to_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.authorize_endpoint).map_err(|e| {
            Error::Config(format!(
                "invalid authorize endpoint {}: {e}",
                self.authorize_endpoint
            ))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("scope", &self.scope)
                .append_pair("code_challenge", &self.code_challenge)
                .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD)
                .append_pair("state", &self.state);
            for (name, value) in &self.extra_params {
                query.append_pair(name, value);
            }
        }

        Ok(url.into())
    }
}
