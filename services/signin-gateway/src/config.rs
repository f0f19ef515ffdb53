//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from SIGNIN_CLIENT_SECRET or client_secret_file,
//! never stored in the TOML directly to avoid leaking secrets.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use session::ClientConfig;

/// Environment variable holding the OAuth client secret
pub const CLIENT_SECRET_ENV: &str = "SIGNIN_CLIENT_SECRET";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub client: ClientSection,
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    pub api: ApiSection,
}

/// OAuth client registration at the identity provider
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    pub client_id: String,
    /// Tenant base URL; endpoints default to well-known paths under it
    pub base_url: String,
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub authorize_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub after_sign_out_url: Option<String>,
    /// Path to a file containing the client secret (alternative to SIGNIN_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    pub listen_addr: SocketAddr,
    /// Public origin of the application, e.g. `https://app.example`
    pub app_origin: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Session lifetime and storage
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: u64,
    #[serde(default = "default_flow_ttl")]
    pub flow_ttl_secs: u64,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
}

/// Protected API reached through `/api/*`
#[derive(Debug, Deserialize)]
pub struct ApiSection {
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            refresh_skew_secs: default_refresh_skew(),
            flow_ttl_secs: default_flow_ttl(),
            storage_path: default_storage_path(),
        }
    }
}

fn default_scopes() -> Vec<String> {
    vec!["openid".into()]
}

fn default_max_connections() -> usize {
    1000
}

fn default_refresh_skew() -> u64 {
    60
}

fn default_flow_ttl() -> u64 {
    600
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("signin-gateway-keystore.json")
}

fn default_timeout() -> u64 {
    30
}

fn require_http(field: &str, value: &str) -> common::Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )))
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. SIGNIN_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
            config.client.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.client.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.client.client_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.client.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }

        require_http("base_url", &self.client.base_url)?;
        require_http("redirect_uri", &self.client.redirect_uri)?;
        require_http("app_origin", &self.server.app_origin)?;
        require_http("upstream_url", &self.api.upstream_url)?;
        let optional = [
            ("authorize_endpoint", &self.client.authorize_endpoint),
            ("token_endpoint", &self.client.token_endpoint),
            ("end_session_endpoint", &self.client.end_session_endpoint),
            ("after_sign_out_url", &self.client.after_sign_out_url),
        ];
        for (field, value) in optional {
            if let Some(value) = value {
                require_http(field, value)?;
            }
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.session.flow_ttl_secs == 0 {
            return Err(common::Error::Config(
                "flow_ttl_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// The coordinator's view of the client settings.
    pub fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new(
            self.client.client_id.clone(),
            self.client.base_url.clone(),
            self.client.redirect_uri.clone(),
        );
        client.scopes = self.client.scopes.clone();
        client.authorize_endpoint = self.client.authorize_endpoint.clone();
        client.token_endpoint = self.client.token_endpoint.clone();
        client.end_session_endpoint = self.client.end_session_endpoint.clone();
        client.after_sign_out_url = self.client.after_sign_out_url.clone();
        client.refresh_skew = Duration::from_secs(self.session.refresh_skew_secs);
        client.flow_ttl = Duration::from_secs(self.session.flow_ttl_secs);
        client
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("signin-gateway.toml")
    }
}
