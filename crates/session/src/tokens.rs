//! Session record storage and refresh scheduling
//!
//! `TokenStore` persists the single session record in the key store.
//! `TokenManager` hands out access tokens and owns the refresh policy:
//!
//! - an unexpired token (outside the safety skew) is returned without suspending
//! - the first caller to see an expiring token starts one refresh and parks a
//!   shared handle to it; every concurrent caller awaits that same handle
//! - on success the record is replaced in one write; on rejection the record
//!   is cleared and every waiter gets `SessionExpired`
//! - a rejected refresh is never retried, since reusing a refresh token can
//!   itself revoke it at the provider
//!
//! The pending handle is keyed by `session_id`, so a refresh started for a
//! session that has since been replaced is never handed to the new session.
//! A refresh only writes back while it still owns the pending slot and the
//! stored record is still its session; otherwise its result is discarded.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use oauth_pkce::{KeyStore, SESSION_KEY, SESSION_NAMESPACE, TokenEndpoint, TokenResponse, now_millis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// The locally persisted authenticated session.
///
/// `expires_at` is a unix timestamp in milliseconds, computed from the token
/// response's `expires_in` in the same constructor that stores the token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    pub expires_at: u64,
    pub scope: String,
    pub session_id: String,
}

impl SessionRecord {
    /// Build a record from a code-exchange response.
    pub fn from_token_response(
        response: TokenResponse,
        session_id: String,
        requested_scope: &str,
        now_millis: u64,
    ) -> Self {
        Self {
            expires_at: now_millis.saturating_add(response.expires_in.saturating_mul(1000)),
            scope: response.scope.unwrap_or_else(|| requested_scope.to_string()),
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            id_token: response.id_token,
            session_id,
        }
    }

    /// The record after a successful refresh. Tokens the provider did not
    /// rotate are carried over.
    pub fn refreshed(&self, response: TokenResponse, now_millis: u64) -> Self {
        Self {
            expires_at: now_millis.saturating_add(response.expires_in.saturating_mul(1000)),
            scope: response.scope.unwrap_or_else(|| self.scope.clone()),
            access_token: response.access_token,
            refresh_token: response.refresh_token.or_else(|| self.refresh_token.clone()),
            id_token: response.id_token.or_else(|| self.id_token.clone()),
            session_id: self.session_id.clone(),
        }
    }

    /// Whether the token expires within `skew` of `now_millis`.
    pub fn expires_within(&self, skew: Duration, now_millis: u64) -> bool {
        self.expires_at <= now_millis.saturating_add(skew.as_millis() as u64)
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Session record persistence under a single well-known key.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyStore>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    /// Replace the session record in one write.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let raw = serde_json::to_string(record)
            .map_err(|e| Error::Storage(format!("serializing session record: {e}")))?;
        self.store.put(SESSION_NAMESPACE, SESSION_KEY, &raw)?;
        debug!(session_id = %record.session_id, expires_at = record.expires_at, "session record saved");
        Ok(())
    }

    /// Read the session record. A record that no longer parses is dropped.
    pub fn read(&self) -> Result<Option<SessionRecord>> {
        let Some(raw) = self.store.get(SESSION_NAMESPACE, SESSION_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(error = %e, "discarding unreadable session record");
                self.clear()?;
                Ok(None)
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.store.delete(SESSION_NAMESPACE, SESSION_KEY)?;
        Ok(())
    }
}

type RefreshOutcome = std::result::Result<SessionRecord, Error>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct PendingRefresh {
    session_id: String,
    generation: u64,
    future: SharedRefresh,
}

type PendingSlot = Mutex<Option<PendingRefresh>>;

/// Access-token source with single-flight refresh.
pub struct TokenManager {
    store: TokenStore,
    endpoint: Arc<dyn TokenEndpoint>,
    skew: Duration,
    pending: Arc<PendingSlot>,
    generation: AtomicU64,
}

impl TokenManager {
    pub fn new(store: TokenStore, endpoint: Arc<dyn TokenEndpoint>, skew: Duration) -> Self {
        Self {
            store,
            endpoint,
            skew,
            pending: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// A valid access token, refreshing first if it is within the skew of expiry.
    pub async fn valid_access_token(&self) -> Result<String> {
        let skew = self.skew;
        let handle = self.refresh_if(|record| record.expires_within(skew, now_millis()))?;
        Ok(handle.await?.access_token)
    }

    /// Refresh after the server rejected `rejected_token`.
    ///
    /// If another caller already replaced that token, the newer token is
    /// returned without a second refresh.
    pub async fn force_refresh(&self, rejected_token: &str) -> Result<String> {
        let skew = self.skew;
        let handle = self.refresh_if(|record| {
            record.access_token == rejected_token || record.expires_within(skew, now_millis())
        })?;
        Ok(handle.await?.access_token)
    }

    /// Refresh unconditionally (joining one already in flight).
    pub async fn refresh(&self) -> Result<SessionRecord> {
        self.refresh_if(|_| true)?.await
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        lock_slot(&self.pending)
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Detach the in-flight refresh, if any. Its result is discarded rather
    /// than written back; callers already waiting on it get `SessionExpired`.
    ///
    /// Called whenever the session is ended or replaced.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut slot) = lock_slot(&self.pending) {
            if let Some(pending) = slot.take() {
                debug!(session_id = %pending.session_id, "detached in-flight refresh");
            }
        }
    }

    /// Resolve immediately with the stored record unless `needs_refresh`
    /// says otherwise; then join the in-flight refresh for the current
    /// session or start one.
    ///
    /// The store is re-read under the slot lock. A finishing refresh saves its
    /// record and empties the slot under that same lock, so a caller holding a
    /// stale view never starts a second refresh with a rotated refresh token.
    fn refresh_if(&self, needs_refresh: impl Fn(&SessionRecord) -> bool) -> Result<SharedRefresh> {
        let mut slot = lock_slot(&self.pending)?;

        let record = self
            .store
            .read()?
            .ok_or_else(|| Error::SessionExpired("no active session".into()))?;

        if !needs_refresh(&record) {
            return Ok(futures_util::future::ready(Ok(record)).boxed().shared());
        }

        if let Some(pending) = slot.as_ref() {
            if pending.session_id == record.session_id {
                debug!(session_id = %record.session_id, "joining in-flight refresh");
                return Ok(pending.future.clone());
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!(session_id = %record.session_id, "access token expiring, starting refresh");
        let future = run_refresh(
            self.store.clone(),
            self.endpoint.clone(),
            record.clone(),
            Arc::downgrade(&self.pending),
            generation,
        )
        .boxed()
        .shared();

        *slot = Some(PendingRefresh {
            session_id: record.session_id,
            generation,
            future: future.clone(),
        });
        Ok(future)
    }
}

fn lock_slot(slot: &PendingSlot) -> Result<MutexGuard<'_, Option<PendingRefresh>>> {
    slot.lock()
        .map_err(|_| Error::Storage("refresh slot lock poisoned".into()))
}

/// One refresh attempt. Runs at most once per shared handle.
async fn run_refresh(
    store: TokenStore,
    endpoint: Arc<dyn TokenEndpoint>,
    record: SessionRecord,
    slot: Weak<PendingSlot>,
    generation: u64,
) -> RefreshOutcome {
    let attempt = match record.refresh_token.as_deref() {
        None => Err(Error::SessionExpired(
            "access token expired and session has no refresh token".into(),
        )),
        Some(refresh_token) => match endpoint.refresh(refresh_token).await {
            Ok(response) => Ok(record.refreshed(response, now_millis())),
            Err(oauth_pkce::Error::Http(msg)) => Err(Error::Network(msg)),
            Err(e) => Err(Error::SessionExpired(e.to_string())),
        },
    };

    let Some(slot) = slot.upgrade() else {
        return Err(Error::SessionExpired("token manager dropped during refresh".into()));
    };
    settle(&store, &record, attempt, &slot, generation)
}

/// Write a refresh attempt back, holding the slot lock so no caller reads
/// the store between the write and the slot being emptied.
fn settle(
    store: &TokenStore,
    record: &SessionRecord,
    attempt: RefreshOutcome,
    slot: &PendingSlot,
    generation: u64,
) -> RefreshOutcome {
    let mut slot = lock_slot(slot)?;
    let owns_slot = slot.as_ref().is_some_and(|p| p.generation == generation);
    if owns_slot {
        *slot = None;
    }
    let still_current = owns_slot
        && matches!(store.read(), Ok(Some(ref stored)) if stored.session_id == record.session_id);
    if !still_current {
        info!(session_id = %record.session_id, "session ended during refresh, discarding result");
        crate::metrics::record_refresh("superseded");
        return Err(Error::SessionExpired("session ended while refreshing".into()));
    }

    let outcome = attempt.and_then(|updated| store.save(&updated).map(|()| updated));
    match &outcome {
        Ok(updated) => {
            info!(session_id = %updated.session_id, expires_at = updated.expires_at, "token refresh succeeded");
            crate::metrics::record_refresh("success");
        }
        Err(Error::SessionExpired(msg)) => {
            warn!(session_id = %record.session_id, error = %msg, "refresh rejected, clearing session");
            if let Err(e) = store.clear() {
                warn!(error = %e, "failed to clear expired session");
            }
            crate::metrics::record_refresh("rejected");
        }
        Err(e) => {
            warn!(session_id = %record.session_id, error = %e, "refresh failed, session kept");
            crate::metrics::record_refresh("error");
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeEndpoint, future_expiry, past_expiry, test_record};
    use oauth_pkce::MemoryKeyStore;
    use std::sync::atomic::Ordering;

    fn manager(endpoint: Arc<FakeEndpoint>, record: Option<SessionRecord>) -> TokenManager {
        let store = TokenStore::new(Arc::new(MemoryKeyStore::new()));
        if let Some(record) = record {
            store.save(&record).unwrap();
        }
        TokenManager::new(store, endpoint, Duration::from_secs(60))
    }

    #[test]
    fn record_expiry_is_derived_from_response() {
        let response = TokenResponse {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            id_token: None,
            expires_in: 3600,
            scope: None,
            token_type: None,
        };
        let record = SessionRecord::from_token_response(response, "sid".into(), "openid", 1_000);
        assert_eq!(record.expires_at, 3_601_000);
        assert_eq!(record.scope, "openid");
    }

    #[test]
    fn refreshed_keeps_unrotated_tokens() {
        let mut original = test_record("old", future_expiry());
        original.id_token = Some("id".into());
        let response = TokenResponse {
            access_token: "new".into(),
            refresh_token: None,
            id_token: None,
            expires_in: 60,
            scope: Some("openid email".into()),
            token_type: None,
        };
        let updated = original.refreshed(response, 10_000);
        assert_eq!(updated.access_token, "new");
        assert_eq!(updated.refresh_token, original.refresh_token);
        assert_eq!(updated.id_token.as_deref(), Some("id"));
        assert_eq!(updated.expires_at, 70_000);
        assert_eq!(updated.scope, "openid email");
        assert_eq!(updated.session_id, original.session_id);
    }

    #[test]
    fn expires_within_honours_skew() {
        let record = test_record("at", 100_000);
        assert!(!record.expires_within(Duration::from_secs(10), 50_000));
        assert!(record.expires_within(Duration::from_secs(60), 50_000));
        assert!(record.expires_within(Duration::ZERO, 100_000));
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let debug = format!("{:?}", test_record("secret-access", future_expiry()));
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("rt_secret-access"));
        assert!(debug.contains("session_id"));
    }

    #[test]
    fn store_save_read_clear() {
        let store = TokenStore::new(Arc::new(MemoryKeyStore::new()));
        assert!(store.read().unwrap().is_none());

        let record = test_record("at", future_expiry());
        store.save(&record).unwrap();
        assert_eq!(store.read().unwrap(), Some(record));

        store.clear().unwrap();
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn corrupt_record_reads_as_absent() {
        let keys = Arc::new(MemoryKeyStore::new());
        keys.put(SESSION_NAMESPACE, SESSION_KEY, "{not json").unwrap();
        let store = TokenStore::new(keys.clone());

        assert!(store.read().unwrap().is_none());
        assert!(keys.get(SESSION_NAMESPACE, SESSION_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn unexpired_token_needs_no_network_call() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let manager = manager(endpoint.clone(), Some(test_record("at_live", future_expiry())));

        assert_eq!(manager.valid_access_token().await.unwrap(), "at_live");
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 0);
        assert!(!manager.is_refreshing());
    }

    #[tokio::test]
    async fn no_session_is_session_expired() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let manager = manager(endpoint.clone(), None);

        let err = manager.valid_access_token().await.unwrap_err();
        assert_eq!(err.code(), "session_expired");
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_saved() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let manager = manager(endpoint.clone(), Some(test_record("at_old", past_expiry())));

        assert_eq!(manager.valid_access_token().await.unwrap(), "at_refreshed_1");

        let stored = manager.store().read().unwrap().unwrap();
        assert_eq!(stored.access_token, "at_refreshed_1");
        assert!(stored.expires_at > now_millis());
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
        assert!(!manager.is_refreshing());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let endpoint = Arc::new(FakeEndpoint::new().with_delay(Duration::from_millis(50)));
        let manager = Arc::new(manager(
            endpoint.clone(),
            Some(test_record("at_old", past_expiry())),
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.valid_access_token().await }));
        }

        let mut tokens = Vec::new();
        for h in handles {
            tokens.push(h.await.unwrap().unwrap());
        }

        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "at_refreshed_1"), "{tokens:?}");
    }

    #[tokio::test]
    async fn rejected_refresh_clears_session_for_all_waiters() {
        let endpoint = Arc::new(
            FakeEndpoint::new()
                .with_delay(Duration::from_millis(20))
                .rejecting_refresh(),
        );
        let manager = Arc::new(manager(
            endpoint.clone(),
            Some(test_record("at_old", past_expiry())),
        ));

        let (a, b) = tokio::join!(manager.valid_access_token(), manager.valid_access_token());
        assert_eq!(a.unwrap_err().code(), "session_expired");
        assert_eq!(b.unwrap_err().code(), "session_expired");
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
        assert!(manager.store().read().unwrap().is_none());

        // Not retried: the session is gone, so no further refresh call happens
        assert!(manager.valid_access_token().await.is_err());
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn network_failure_keeps_session() {
        let endpoint = Arc::new(FakeEndpoint::new().unreachable());
        let manager = manager(endpoint.clone(), Some(test_record("at_old", past_expiry())));

        let err = manager.valid_access_token().await.unwrap_err();
        assert_eq!(err.code(), "network_error");
        assert!(manager.store().read().unwrap().is_some());
        assert!(!manager.is_refreshing());
    }

    #[tokio::test]
    async fn missing_refresh_token_expires_session() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let mut record = test_record("at_old", past_expiry());
        record.refresh_token = None;
        let manager = manager(endpoint.clone(), Some(record));

        let err = manager.valid_access_token().await.unwrap_err();
        assert_eq!(err.code(), "session_expired");
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 0);
        assert!(manager.store().read().unwrap().is_none());
    }

    #[tokio::test]
    async fn force_refresh_refreshes_rejected_live_token() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let manager = manager(endpoint.clone(), Some(test_record("at_live", future_expiry())));

        assert_eq!(manager.force_refresh("at_live").await.unwrap(), "at_refreshed_1");
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_reuses_token_already_replaced() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let manager = manager(endpoint.clone(), Some(test_record("at_newer", future_expiry())));

        assert_eq!(manager.force_refresh("at_stale").await.unwrap(), "at_newer");
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sequential_refreshes_each_call_endpoint() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let manager = manager(endpoint.clone(), Some(test_record("at", future_expiry())));

        assert_eq!(manager.refresh().await.unwrap().access_token, "at_refreshed_1");
        assert_eq!(manager.refresh().await.unwrap().access_token, "at_refreshed_2");
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unexpired_read_does_not_wait_for_pending_refresh() {
        let endpoint = Arc::new(FakeEndpoint::new().with_delay(Duration::from_millis(500)));
        let manager = Arc::new(manager(
            endpoint.clone(),
            Some(test_record("at_live", future_expiry())),
        ));

        let refreshing = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await })
        };
        while !manager.is_refreshing() {
            tokio::task::yield_now().await;
        }

        let started = std::time::Instant::now();
        assert_eq!(manager.valid_access_token().await.unwrap(), "at_live");
        assert!(started.elapsed() < Duration::from_millis(250));

        assert_eq!(refreshing.await.unwrap().unwrap().access_token, "at_refreshed_1");
    }

    #[tokio::test]
    async fn invalidated_refresh_does_not_restore_session() {
        let endpoint = Arc::new(FakeEndpoint::new().with_delay(Duration::from_millis(50)));
        let manager = Arc::new(manager(
            endpoint.clone(),
            Some(test_record("at_old", past_expiry())),
        ));

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.valid_access_token().await })
        };
        while !manager.is_refreshing() {
            tokio::task::yield_now().await;
        }
        manager.invalidate();
        manager.store().clear().unwrap();

        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "session_expired");
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
        assert!(manager.store().read().unwrap().is_none());
        assert!(!manager.is_refreshing());
    }

    #[tokio::test]
    async fn failed_refresh_leaves_replacement_session_alone() {
        let endpoint = Arc::new(
            FakeEndpoint::new()
                .with_delay(Duration::from_millis(50))
                .rejecting_refresh(),
        );
        let manager = Arc::new(manager(
            endpoint.clone(),
            Some(test_record("at_old", past_expiry())),
        ));

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.valid_access_token().await })
        };
        while !manager.is_refreshing() {
            tokio::task::yield_now().await;
        }
        let mut replacement = test_record("at_new", future_expiry());
        replacement.session_id = "session-2".into();
        manager.invalidate();
        manager.store().save(&replacement).unwrap();

        assert!(waiting.await.unwrap().is_err());
        assert_eq!(manager.store().read().unwrap(), Some(replacement));
        assert_eq!(manager.valid_access_token().await.unwrap(), "at_new");
    }
}
