//! Session coordinator
//!
//! The sign-in state machine:
//!
//! ```text
//! Unauthenticated -> FlowStarted -> AwaitingCallback -> Authenticated
//!                                                         |  ^
//!                                                         v  |
//!                                                      Refreshing -> Unauthenticated
//! ```
//!
//! plus `Authenticated -> Unauthenticated` on sign-out. A coordinator is an
//! ordinary value owning its key store, token endpoint and navigator; callers
//! share it through an `Arc`.

use std::sync::{Arc, Mutex, MutexGuard};

use oauth_pkce::{
    AuthorizationRequest, KeyStore, PkceManager, TokenEndpoint, encoding, now_millis, state,
};
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::config::{ClientConfig, Endpoints};
use crate::error::{Error, Result};
use crate::navigation::{self, Navigator};
use crate::tokens::{SessionRecord, TokenManager, TokenStore};

/// Where the coordinator is in the sign-in lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    FlowStarted,
    AwaitingCallback,
    Authenticated,
    Refreshing,
}

/// Per-call sign-in options.
#[derive(Debug, Clone, Default)]
pub struct SignInOptions {
    /// Application state to recover after the callback (return path, tab id, ...)
    pub state: Option<String>,
    pub prompt: Option<String>,
    pub login_hint: Option<String>,
    pub extra_params: Vec<(String, String)>,
}

/// Query parameters of the redirect back from the authorization server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub session_state: Option<String>,
}

impl CallbackParams {
    /// Parse a raw query string (with or without the leading `?`).
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        let query = query.strip_prefix('?').unwrap_or(query);
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match &*name {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                "session_state" => &mut params.session_state,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }
        params
    }

    /// Parse the full callback URL.
    pub fn from_url(callback_url: &str) -> Result<Self> {
        let url = Url::parse(callback_url)
            .map_err(|e| Error::Validation(format!("invalid callback URL: {e}")))?;
        Ok(Self::from_query(url.query().unwrap_or_default()))
    }
}

/// Non-secret view of the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub scope: String,
    /// Unix milliseconds
    pub expires_at: u64,
    pub has_refresh_token: bool,
}

impl From<&SessionRecord> for SessionInfo {
    fn from(record: &SessionRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            scope: record.scope.clone(),
            expires_at: record.expires_at,
            has_refresh_token: record.refresh_token.is_some(),
        }
    }
}

/// Result of a completed sign-in.
#[derive(Debug, Clone, Serialize)]
pub struct SignInOutcome {
    pub session: SessionInfo,
    /// Application state passed to `start_sign_in`, recovered from the callback
    pub caller_state: Option<String>,
    pub flow_key: String,
}

pub struct SessionCoordinator {
    config: ClientConfig,
    app_origin: Url,
    store: Arc<dyn KeyStore>,
    pkce: PkceManager,
    tokens: TokenManager,
    endpoint: Arc<dyn TokenEndpoint>,
    navigator: Arc<dyn Navigator>,
    state: Mutex<AuthState>,
}

impl SessionCoordinator {
    /// Build a coordinator over injected collaborators. A session already in
    /// `store` (from a previous process, say) starts out `Authenticated`.
    pub fn new(
        config: ClientConfig,
        app_origin: Url,
        store: Arc<dyn KeyStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let token_store = TokenStore::new(store.clone());
        let initial = match token_store.read() {
            Ok(Some(_)) => AuthState::Authenticated,
            _ => AuthState::Unauthenticated,
        };
        Self {
            pkce: PkceManager::new(store.clone()),
            tokens: TokenManager::new(token_store, endpoint.clone(), config.refresh_skew),
            config,
            app_origin,
            store,
            endpoint,
            navigator,
            state: Mutex::new(initial),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn app_origin(&self) -> &Url {
        &self.app_origin
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Current lifecycle state. A session cleared behind the coordinator's
    /// back (rejected refresh) reads as `Unauthenticated`.
    pub fn state(&self) -> AuthState {
        let current = *self.lock_state();
        if current != AuthState::Authenticated {
            return current;
        }
        if self.tokens.is_refreshing() {
            AuthState::Refreshing
        } else if self.is_signed_in() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    /// Start a sign-in: store a PKCE flow, derive state, and navigate to the
    /// authorize endpoint. Earlier pending flows stay redeemable.
    ///
    /// Re-authenticating over a live session keeps the coordinator
    /// `Authenticated` until the callback replaces the session.
    pub fn start_sign_in(&self, options: SignInOptions) -> Result<AuthorizationRequest> {
        self.config.validate()?;
        let endpoints = self.config.endpoints()?;

        if let Err(e) = self.pkce.prune_expired(self.config.flow_ttl) {
            warn!(error = %e, "failed to prune abandoned flows");
        }

        let signed_in = self.is_signed_in();
        if !signed_in {
            self.set_state(AuthState::FlowStarted);
        }
        let (request, url) = match self.build_request(&endpoints, options) {
            Ok(built) => built,
            Err(e) => {
                self.set_state(self.settled_state());
                return Err(e);
            }
        };

        navigation::navigate(self.navigator.as_ref(), &self.app_origin, &url);
        if !signed_in {
            self.set_state(AuthState::AwaitingCallback);
        }
        info!(state = %request.state, signed_in, "sign-in started");
        Ok(request)
    }

    fn build_request(
        &self,
        endpoints: &Endpoints,
        options: SignInOptions,
    ) -> Result<(AuthorizationRequest, String)> {
        let challenge = self.pkce.begin_challenge()?;
        let state = state::derive_state(&challenge.flow_key, options.state.as_deref());
        self.pkce.record_state(&challenge.flow_key, &state)?;

        let mut extra_params = Vec::new();
        if let Some(prompt) = options.prompt {
            extra_params.push(("prompt".to_string(), prompt));
        }
        if let Some(hint) = options.login_hint {
            extra_params.push(("login_hint".to_string(), hint));
        }
        extra_params.extend(options.extra_params);

        let request = AuthorizationRequest {
            authorize_endpoint: endpoints.authorize.clone(),
            client_id: self.config.client_id.clone(),
            redirect_uri: self.config.redirect_uri.clone(),
            scope: self.config.scope(),
            code_challenge: challenge.challenge,
            state,
            extra_params,
        };
        match request.to_url() {
            Ok(url) => Ok((request, url)),
            Err(e) => {
                self.pkce.consume_verifier(&challenge.flow_key).ok();
                Err(e.into())
            }
        }
    }

    /// Redeem a callback. Any failure leaves the coordinator `Unauthenticated`
    /// with no session record.
    pub async fn complete_sign_in(&self, params: CallbackParams) -> Result<SignInOutcome> {
        match self.redeem(params).await {
            Ok(outcome) => {
                self.set_state(AuthState::Authenticated);
                crate::metrics::record_sign_in("success");
                info!(
                    session_id = %outcome.session.session_id,
                    flow_key = %outcome.flow_key,
                    "sign-in completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.tokens.invalidate();
                if let Err(clear_err) = self.tokens.store().clear() {
                    warn!(error = %clear_err, "failed to clear session after sign-in failure");
                }
                self.set_state(AuthState::Unauthenticated);
                crate::metrics::record_sign_in(e.code());
                warn!(code = e.code(), error = %e, "sign-in failed");
                Err(e)
            }
        }
    }

    async fn redeem(&self, params: CallbackParams) -> Result<SignInOutcome> {
        let returned_state = params
            .state
            .ok_or_else(|| Error::Correlation("callback carried no state".into()))?;
        let flow_key = self.correlate(&returned_state)?;

        // Consumed before anything else can fail, so a callback redeems its flow once
        let verifier = self.pkce.consume_verifier(&flow_key)?;

        if let Some(error) = params.error {
            let detail = params.error_description.unwrap_or_default();
            return Err(Error::TokenExchange(format!(
                "authorization server returned {error}: {detail}"
            )));
        }
        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Validation("callback carried no authorization code".into()))?;

        let response = self
            .endpoint
            .exchange_code(&code, verifier.expose(), &self.config.redirect_uri)
            .await?;

        let record = SessionRecord::from_token_response(
            response,
            uuid::Uuid::new_v4().to_string(),
            &self.config.scope(),
            now_millis(),
        );
        self.tokens.invalidate();
        self.tokens.store().save(&record)?;

        Ok(SignInOutcome {
            session: SessionInfo::from(&record),
            caller_state: state::caller_state(&returned_state).map(str::to_string),
            flow_key,
        })
    }

    /// Locate the flow a returned state belongs to.
    ///
    /// An embedded suffix must name a pending flow whose recorded state
    /// matches. Without one, the greatest pending flow key is used.
    fn correlate(&self, returned_state: &str) -> Result<String> {
        match state::extract_flow_suffix(returned_state) {
            Some(suffix) => {
                let flow = self.pkce.flow(suffix)?.ok_or_else(|| {
                    Error::Correlation(format!("no pending sign-in flow for {suffix}"))
                })?;
                if flow.state.as_deref().is_some_and(|s| s != returned_state) {
                    return Err(Error::Correlation(format!(
                        "state does not match pending flow {suffix}"
                    )));
                }
                Ok(suffix.to_string())
            }
            None => state::resolve_latest_flow(self.store.as_ref())?
                .ok_or_else(|| Error::Correlation("no pending sign-in flow".into())),
        }
    }

    /// Clear the session and every pending flow, then navigate to the
    /// end-session endpoint when a post-sign-out URL is configured.
    ///
    /// Returns the end-session URL that was navigated to, if any.
    pub fn sign_out(&self) -> Result<Option<String>> {
        let id_token = self
            .tokens
            .store()
            .read()
            .ok()
            .flatten()
            .and_then(|record| record.id_token);

        self.set_state(AuthState::Unauthenticated);
        self.tokens.invalidate();
        self.tokens.store().clear()?;
        let flows = self.pkce.clear()?;
        info!(flows, "signed out locally");

        if self.config.after_sign_out_url.is_none() {
            return Ok(None);
        }
        let url = self.sign_out_url(id_token.as_deref())?;
        navigation::navigate(self.navigator.as_ref(), &self.app_origin, &url);
        Ok(Some(url))
    }

    /// End-session URL with `id_token_hint`, `post_logout_redirect_uri` and `client_id`.
    pub fn sign_out_url(&self, id_token_hint: Option<&str>) -> Result<String> {
        let endpoints = self.config.endpoints()?;
        let mut url = Url::parse(&endpoints.end_session)
            .map_err(|e| Error::Validation(format!("invalid end-session endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(hint) = id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
            if let Some(redirect) = &self.config.after_sign_out_url {
                query.append_pair("post_logout_redirect_uri", redirect);
            }
            query.append_pair("client_id", &self.config.client_id);
        }
        Ok(url.into())
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self.tokens.store().read(), Ok(Some(_)))
    }

    pub fn session_info(&self) -> Result<Option<SessionInfo>> {
        Ok(self.tokens.store().read()?.as_ref().map(SessionInfo::from))
    }

    /// A valid access token, refreshing if it is about to expire.
    pub async fn access_token(&self) -> Result<String> {
        let result = self.tokens.valid_access_token().await;
        self.observe(result)
    }

    /// Refresh after a server rejected `rejected_token`, unless another
    /// caller has already replaced it.
    pub async fn force_refresh(&self, rejected_token: &str) -> Result<String> {
        let result = self.tokens.force_refresh(rejected_token).await;
        self.observe(result)
    }

    /// Refresh now, regardless of expiry.
    pub async fn refresh_access_token(&self) -> Result<SessionInfo> {
        let result = self.tokens.refresh().await;
        self.observe(result).map(|record| SessionInfo::from(&record))
    }

    /// Decoded ID token payload. The signature is not checked.
    pub fn id_token_claims(&self) -> Result<Option<serde_json::Value>> {
        let Some(id_token) = self.tokens.store().read()?.and_then(|r| r.id_token) else {
            return Ok(None);
        };
        let payload = id_token
            .split('.')
            .nth(1)
            .ok_or_else(|| Error::Validation("id token is not a JWT".into()))?;
        let bytes = encoding::decode(payload)?;
        let claims = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Validation(format!("id token payload is not JSON: {e}")))?;
        Ok(Some(claims))
    }

    /// A session that replaced the expired one keeps its state.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::SessionExpired(_)) = &result {
            if !self.is_signed_in() {
                self.set_state(AuthState::Unauthenticated);
            }
        }
        result
    }

    /// The state to fall back to when a sign-in attempt is abandoned early.
    fn settled_state(&self) -> AuthState {
        if self.is_signed_in() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: AuthState) {
        *self.lock_state() = next;
    }
}
