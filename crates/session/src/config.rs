//! Client configuration and endpoint resolution
//!
//! Endpoints default to well-known paths under the tenant base URL. The base
//! URL is a pure input: whatever resolves the organization (path, subdomain,
//! discovery) happens before a `ClientConfig` is built.

use std::time::Duration;

use oauth_pkce::{AUTHORIZE_PATH, DEFAULT_SCOPE, END_SESSION_PATH, TOKEN_PATH};
use url::Url;

use crate::error::{Error, Result};

/// Refresh this long before the access token expires.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(60);

/// Abandoned flow records older than this are pruned on the next sign-in.
pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(600);

/// Public OAuth client settings for one coordinator instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    /// Tenant base URL, e.g. `https://id.example/t/acme`
    pub base_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub authorize_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub end_session_endpoint: Option<String>,
    /// Where the identity provider sends the browser after end-session
    pub after_sign_out_url: Option<String>,
    pub refresh_skew: Duration,
    pub flow_ttl: Duration,
}

/// Resolved absolute endpoint URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub authorize: String,
    pub token: String,
    pub end_session: String,
}

impl ClientConfig {
    pub fn new(
        client_id: impl Into<String>,
        base_url: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            base_url: base_url.into(),
            redirect_uri: redirect_uri.into(),
            scopes: vec![DEFAULT_SCOPE.to_string()],
            authorize_endpoint: None,
            token_endpoint: None,
            end_session_endpoint: None,
            after_sign_out_url: None,
            refresh_skew: DEFAULT_REFRESH_SKEW,
            flow_ttl: DEFAULT_FLOW_TTL,
        }
    }

    /// Space-separated scope string; falls back to `openid` when none are set.
    pub fn scope(&self) -> String {
        let scopes: Vec<&str> = self
            .scopes
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if scopes.is_empty() {
            DEFAULT_SCOPE.to_string()
        } else {
            scopes.join(" ")
        }
    }

    /// Resolve endpoint URLs, preferring explicit overrides over base-URL defaults.
    pub fn endpoints(&self) -> Result<Endpoints> {
        let base = self.base_url.trim_end_matches('/');
        let resolve = |explicit: &Option<String>, path: &str| {
            let url = explicit
                .clone()
                .unwrap_or_else(|| format!("{base}{path}"));
            require_http_url(&url, "endpoint")?;
            Ok::<_, Error>(url)
        };

        Ok(Endpoints {
            authorize: resolve(&self.authorize_endpoint, AUTHORIZE_PATH)?,
            token: resolve(&self.token_endpoint, TOKEN_PATH)?,
            end_session: resolve(&self.end_session_endpoint, END_SESSION_PATH)?,
        })
    }

    /// Reject configuration the sign-in flow cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Validation("client_id must not be empty".into()));
        }
        require_http_url(&self.redirect_uri, "redirect_uri")?;
        if let Some(url) = &self.after_sign_out_url {
            require_http_url(url, "after_sign_out_url")?;
        }
        self.endpoints()?;
        Ok(())
    }
}

fn require_http_url(value: &str, field: &str) -> Result<Url> {
    let url = Url::parse(value)
        .map_err(|e| Error::Validation(format!("{field} is not a valid URL ({value}): {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::Validation(format!(
            "{field} must use http:// or https://, got: {value}"
        )));
    }
    Ok(url)
}
