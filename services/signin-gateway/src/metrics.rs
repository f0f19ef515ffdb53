//! Prometheus metrics exposition
//!
//! The session crate emits through the `metrics` facade:
//!
//! - `auth_sign_in_total` (counter): label `outcome`
//! - `auth_token_refresh_total` (counter): label `outcome`
//! - `auth_request_retries_total` (counter)
//!
//! The gateway adds:
//!
//! - `gateway_api_requests_total` (counter): label `status`

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a request forwarded to the protected API. `status` is the upstream
/// status, or the gateway's own status when the call never completed.
pub fn record_api_request(status: u16) {
    metrics::counter!("gateway_api_requests_total", "status" => status.to_string()).increment(1);
}
