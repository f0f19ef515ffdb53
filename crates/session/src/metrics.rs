//! Counters emitted by the session layer
//!
//! - `auth_sign_in_total` (counter): label `outcome`
//! - `auth_token_refresh_total` (counter): label `outcome`
//!   (`success`, `rejected`, `error`, `superseded`)
//! - `auth_request_retries_total` (counter)
//!
//! Calls are no-ops until the host installs a recorder.

pub(crate) fn record_sign_in(outcome: &'static str) {
    metrics::counter!("auth_sign_in_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_refresh(outcome: &'static str) {
    metrics::counter!("auth_token_refresh_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_request_retry() {
    metrics::counter!("auth_request_retries_total").increment(1);
}
