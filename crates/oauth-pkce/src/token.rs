//! OAuth token exchange and refresh
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (callback completion)
//! 2. Token refresh
//!
//! Both operations POST a form to the tenant's token endpoint with different
//! grant types. `TokenEndpoint` is the seam the session layer depends on, so
//! tests substitute a counting fake for the HTTP implementation.

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. The session
/// layer converts it to an absolute timestamp in the same update that stores
/// the token.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// Boxed future returned by `TokenEndpoint` methods.
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;

/// Abstraction over the token endpoint.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn TokenEndpoint>`).
pub trait TokenEndpoint: Send + Sync {
    /// Exchange an authorization code plus PKCE verifier for tokens.
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> TokenFuture<'a>;

    /// Trade a refresh token for a new access token.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a>;
}

/// Token endpoint client over HTTP.
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<Secret<String>>,
}

impl HttpTokenEndpoint {
    pub fn new(client: reqwest::Client, token_url: String, client_id: String) -> Self {
        Self {
            client,
            token_url,
            client_id,
            client_secret: None,
        }
    }

    /// Authenticate as a confidential client as well as with PKCE.
    pub fn with_client_secret(mut self, secret: Secret<String>) -> Self {
        self.client_secret = Some(secret);
        self
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    async fn post(&self, form: Vec<(&str, &str)>, grant: &str) -> Result<TokenResponse> {
        let mut form: Vec<(&str, &str)> = form;
        form.push(("client_id", self.client_id.as_str()));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose().as_str()));
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{grant} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 400/401/403 on refresh means the refresh token is revoked, expired or invalid
            if grant == "refresh_token" && matches!(status.as_u16(), 400 | 401 | 403) {
                return Err(Error::InvalidCredentials(format!(
                    "refresh token rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "token endpoint returned {status} for {grant}: {body}"
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid {grant} response: {e}")))?;
        debug!(grant, expires_in = token.expires_in, "token endpoint call succeeded");
        Ok(token)
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> TokenFuture<'a> {
        Box::pin(self.post(
            vec![
                ("grant_type", "authorization_code"),
                ("code", code),
                ("code_verifier", verifier),
                ("redirect_uri", redirect_uri),
            ],
            "authorization_code",
        ))
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a> {
        Box::pin(self.post(
            vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
            "refresh_token",
        ))
    }
}
