//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier and S256 challenge used during the OAuth
//! authorization flow, and manages the verifier's lifetime in the key store:
//! stored under a fresh flow key when the flow starts, read-and-deleted
//! exactly once when the callback redeems it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::Secret;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::constants::{FLOW_KEY_WIDTH, FLOW_NAMESPACE};
use crate::encoding;
use crate::error::{Error, Result};
use crate::now_millis;
use crate::store::KeyStore;

/// Bytes of entropy in a code verifier. Encodes to 43 characters, the RFC
/// 7636 minimum length.
pub const VERIFIER_BYTES: usize = 32;

/// Generate a cryptographically random PKCE code verifier.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::rng().fill(&mut bytes);
    encoding::encode(&bytes)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    encoding::encode(&hash)
}

/// One in-flight sign-in attempt as persisted in the key store.
///
/// `created_at` is a unix timestamp in milliseconds, used for TTL pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub verifier: String,
    #[serde(default)]
    pub state: Option<String>,
    pub created_at: u64,
}

/// Result of starting a challenge: what goes into the authorization request,
/// plus the verifier for callers that redeem it in-process.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub flow_key: String,
    pub challenge: String,
    pub verifier: Secret<String>,
}

/// Allocates flow keys and owns verifier storage.
///
/// Flow keys are zero-padded millisecond timestamps, bumped past both the
/// last key this manager issued and every pending key in the store, so keys
/// are unique and lexicographic order matches allocation order.
pub struct PkceManager {
    store: Arc<dyn KeyStore>,
    last_key: Mutex<u64>,
}

impl PkceManager {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            last_key: Mutex::new(0),
        }
    }

    /// Generate a verifier/challenge pair and persist the verifier under a new flow key.
    pub fn begin_challenge(&self) -> Result<PkceChallenge> {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        let flow_key = self.allocate_flow_key()?;

        let record = FlowRecord {
            verifier: verifier.clone(),
            state: None,
            created_at: now_millis(),
        };
        self.write_record(&flow_key, &record)?;
        debug!(flow_key, "pkce challenge created");

        Ok(PkceChallenge {
            flow_key,
            challenge,
            verifier: Secret::new(verifier),
        })
    }

    /// Attach the derived state parameter to a pending flow record.
    pub fn record_state(&self, flow_key: &str, state: &str) -> Result<()> {
        let mut record = self
            .flow(flow_key)?
            .ok_or_else(|| Error::FlowNotFound(format!("flow {flow_key} is not pending")))?;
        record.state = Some(state.to_string());
        self.write_record(flow_key, &record)
    }

    /// Read a pending flow record without consuming it.
    pub fn flow(&self, flow_key: &str) -> Result<Option<FlowRecord>> {
        self.store
            .get(FLOW_NAMESPACE, flow_key)?
            .map(|raw| parse_record(flow_key, &raw))
            .transpose()
    }

    /// Read and delete the verifier for a flow.
    ///
    /// Already consumed, expired, and never-existed flows all return
    /// `FlowNotFound`; callers restart sign-in in every case.
    pub fn consume_verifier(&self, flow_key: &str) -> Result<Secret<String>> {
        let raw = self.store.take(FLOW_NAMESPACE, flow_key)?.ok_or_else(|| {
            Error::FlowNotFound(format!("no pending verifier for flow {flow_key}"))
        })?;
        let record = parse_record(flow_key, &raw)?;
        debug!(flow_key, "pkce verifier consumed");
        Ok(Secret::new(record.verifier))
    }

    /// Pending flow keys in creation order.
    pub fn pending_flows(&self) -> Result<Vec<String>> {
        self.store.list_suffixes(FLOW_NAMESPACE)
    }

    /// Delete flow records older than `ttl`. Unparseable records are deleted too.
    pub fn prune_expired(&self, ttl: Duration) -> Result<usize> {
        let cutoff = now_millis().saturating_sub(ttl.as_millis() as u64);
        let mut pruned = 0;
        for flow_key in self.pending_flows()? {
            let expired = match self.flow(&flow_key) {
                Ok(Some(record)) => record.created_at < cutoff,
                Ok(None) => false,
                Err(e) => {
                    warn!(flow_key, error = %e, "dropping unreadable flow record");
                    true
                }
            };
            if expired {
                self.store.delete(FLOW_NAMESPACE, &flow_key)?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, "pruned abandoned sign-in flows");
        }
        Ok(pruned)
    }

    /// Delete every pending flow record.
    pub fn clear(&self) -> Result<usize> {
        let keys = self.pending_flows()?;
        for flow_key in &keys {
            self.store.delete(FLOW_NAMESPACE, flow_key)?;
        }
        Ok(keys.len())
    }

    fn allocate_flow_key(&self) -> Result<String> {
        let mut last = self
            .last_key
            .lock()
            .map_err(|_| Error::Storage("flow key allocator lock poisoned".into()))?;

        let pending_max = self
            .pending_flows()?
            .iter()
            .filter_map(|key| key.parse::<u64>().ok())
            .max();

        let mut candidate = now_millis().max(*last + 1);
        if let Some(max) = pending_max {
            candidate = candidate.max(max + 1);
        }
        *last = candidate;

        Ok(format!("{candidate:0width$}", width = FLOW_KEY_WIDTH))
    }

    fn write_record(&self, flow_key: &str, record: &FlowRecord) -> Result<()> {
        let raw = serde_json::to_string(record)
            .map_err(|e| Error::Storage(format!("serializing flow record: {e}")))?;
        self.store.put(FLOW_NAMESPACE, flow_key, &raw)
    }
}

fn parse_record(flow_key: &str, raw: &str) -> Result<FlowRecord> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Storage(format!("parsing flow record {flow_key}: {e}")))
}
