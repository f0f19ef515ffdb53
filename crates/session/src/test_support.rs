//! Shared fixtures for the session crate's unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use oauth_pkce::{Error as PkceError, TokenEndpoint, TokenFuture, TokenResponse, now_millis};

use crate::tokens::SessionRecord;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Succeed,
    Reject,
    Unreachable,
}

/// Counting token endpoint. Refreshes mint `at_refreshed_{n}`; exchanges
/// mint `at_exchanged_{n}`.
pub struct FakeEndpoint {
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    delay: Duration,
    exchange: Behaviour,
    refresh: Behaviour,
    id_token: Option<String>,
    last_exchange: Mutex<Option<(String, String, String)>>,
}

impl FakeEndpoint {
    pub fn new() -> Self {
        Self {
            exchanges: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            delay: Duration::ZERO,
            exchange: Behaviour::Succeed,
            refresh: Behaviour::Succeed,
            id_token: None,
            last_exchange: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_id_token(mut self, id_token: &str) -> Self {
        self.id_token = Some(id_token.to_string());
        self
    }

    pub fn rejecting_refresh(mut self) -> Self {
        self.refresh = Behaviour::Reject;
        self
    }

    pub fn rejecting_exchange(mut self) -> Self {
        self.exchange = Behaviour::Reject;
        self
    }

    /// Both grants fail at the transport level.
    pub fn unreachable(mut self) -> Self {
        self.exchange = Behaviour::Unreachable;
        self.refresh = Behaviour::Unreachable;
        self
    }

    /// `(code, verifier, redirect_uri)` of the most recent exchange.
    pub fn last_exchange(&self) -> Option<(String, String, String)> {
        self.last_exchange.lock().unwrap().clone()
    }

    fn respond(
        &self,
        behaviour: Behaviour,
        prefix: &str,
        n: usize,
    ) -> oauth_pkce::Result<TokenResponse> {
        match behaviour {
            Behaviour::Succeed => Ok(TokenResponse {
                access_token: format!("at_{prefix}_{n}"),
                refresh_token: Some(format!("rt_{prefix}_{n}")),
                id_token: self.id_token.clone(),
                expires_in: 3600,
                scope: None,
                token_type: Some("Bearer".into()),
            }),
            Behaviour::Reject if prefix == "refreshed" => Err(PkceError::InvalidCredentials(
                "invalid_grant".into(),
            )),
            Behaviour::Reject => Err(PkceError::TokenExchange("invalid_grant".into())),
            Behaviour::Unreachable => Err(PkceError::Http("connection refused".into())),
        }
    }
}

impl TokenEndpoint for FakeEndpoint {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> TokenFuture<'a> {
        Box::pin(async move {
            let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
            *self.last_exchange.lock().unwrap() =
                Some((code.to_string(), verifier.to_string(), redirect_uri.to_string()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.respond(self.exchange, "exchanged", n)
        })
    }

    fn refresh<'a>(&'a self, _refresh_token: &'a str) -> TokenFuture<'a> {
        Box::pin(async move {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.respond(self.refresh, "refreshed", n)
        })
    }
}

pub fn future_expiry() -> u64 {
    now_millis() + 3_600_000
}

pub fn past_expiry() -> u64 {
    now_millis().saturating_sub(1_000)
}

pub fn test_record(access_token: &str, expires_at: u64) -> SessionRecord {
    SessionRecord {
        access_token: access_token.to_string(),
        refresh_token: Some(format!("rt_{access_token}")),
        id_token: None,
        expires_at,
        scope: "openid".into(),
        session_id: "session-1".into(),
    }
}
