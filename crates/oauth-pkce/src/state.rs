//! State parameter derivation and flow correlation
//!
//! The state sent to the authorization server is `"{caller_state}_request_{suffix}"`,
//! or `"request_{suffix}"` when the caller supplies none. The identity provider
//! echoes it back untouched, which lets the callback find its flow record among
//! several pending ones (one per browser tab, for instance).
//!
//! `resolve_latest_flow` picks the lexicographically greatest pending suffix.
//! That is only "most recent" because flow keys are zero-padded to a fixed
//! width; unpadded numeric suffixes would sort "9" after "10".

use crate::constants::{FLOW_NAMESPACE, STATE_FLOW_MARKER};
use crate::error::Result;
use crate::store::KeyStore;

/// Compose the state parameter for a flow.
pub fn derive_state(flow_suffix: &str, caller_state: Option<&str>) -> String {
    match caller_state.filter(|s| !s.is_empty()) {
        Some(caller) => format!("{caller}_{STATE_FLOW_MARKER}{flow_suffix}"),
        None => format!("{STATE_FLOW_MARKER}{flow_suffix}"),
    }
}

/// Recover the flow suffix embedded by `derive_state`, if any.
///
/// Uses the last marker occurrence so caller state containing the marker
/// text does not confuse extraction.
pub fn extract_flow_suffix(state: &str) -> Option<&str> {
    let start = state.rfind(STATE_FLOW_MARKER)? + STATE_FLOW_MARKER.len();
    let suffix = &state[start..];
    if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
        Some(suffix)
    } else {
        None
    }
}

/// Recover the caller-supplied application state, if any.
pub fn caller_state(state: &str) -> Option<&str> {
    let suffix = extract_flow_suffix(state)?;
    let marker_len = STATE_FLOW_MARKER.len() + suffix.len();
    let head = &state[..state.len() - marker_len];
    head.strip_suffix('_').filter(|s| !s.is_empty())
}

/// Lexicographically greatest pending flow suffix, or `None` if no flow is pending.
pub fn resolve_latest_flow(store: &dyn KeyStore) -> Result<Option<String>> {
    Ok(store.list_suffixes(FLOW_NAMESPACE)?.into_iter().max())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyStore;

    #[test]
    fn derive_without_caller_state() {
        assert_eq!(derive_state("0042", None), "request_0042");
        assert_eq!(derive_state("0042", Some("")), "request_0042");
    }

    #[test]
    fn derive_with_caller_state() {
        assert_eq!(derive_state("0042", Some("tab-7")), "tab-7_request_0042");
    }

    #[test]
    fn extract_roundtrips_derived_state() {
        let state = derive_state("00000001735500000000", Some("return=/home"));
        assert_eq!(extract_flow_suffix(&state), Some("00000001735500000000"));
        assert_eq!(caller_state(&state), Some("return=/home"));
    }

    #[test]
    fn extract_uses_last_marker() {
        let state = derive_state("0099", Some("request_0001"));
        assert_eq!(extract_flow_suffix(&state), Some("0099"));
        assert_eq!(caller_state(&state), Some("request_0001"));
    }

    #[test]
    fn extract_rejects_foreign_state() {
        assert_eq!(extract_flow_suffix("csrf-token-abc"), None);
        assert_eq!(extract_flow_suffix("request_"), None);
        assert_eq!(extract_flow_suffix("request_12ab"), None);
        assert_eq!(caller_state("csrf-token-abc"), None);
    }

    #[test]
    fn caller_state_absent_without_prefix() {
        assert_eq!(caller_state("request_0042"), None);
    }

    #[test]
    fn resolve_latest_picks_greatest_padded_suffix() {
        let store = MemoryKeyStore::new();
        for suffix in ["010", "003", "011"] {
            store.put(FLOW_NAMESPACE, suffix, "{}").unwrap();
        }
        assert_eq!(resolve_latest_flow(&store).unwrap().as_deref(), Some("011"));
    }

    #[test]
    fn resolve_latest_with_no_pending_flows() {
        let store = MemoryKeyStore::new();
        store.put("unrelated", "999", "{}").unwrap();
        assert_eq!(resolve_latest_flow(&store).unwrap(), None);
    }

    #[test]
    fn unpadded_suffixes_sort_lexicographically_not_numerically() {
        // Unpadded keys break "latest wins": "9" sorts after "10".
        let store = MemoryKeyStore::new();
        store.put(FLOW_NAMESPACE, "9", "{}").unwrap();
        store.put(FLOW_NAMESPACE, "10", "{}").unwrap();
        assert_eq!(resolve_latest_flow(&store).unwrap().as_deref(), Some("9"));
    }
}
