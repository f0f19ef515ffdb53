//! Authenticated request dispatch
//!
//! Attaches the current access token to outbound calls. A `401` triggers
//! exactly one forced refresh and one retry; a second `401` is returned as
//! `Error::Authentication`. Network failures are never retried here.

use std::sync::Arc;

use futures_util::future::join_all;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::coordinator::SessionCoordinator;
use crate::error::{Error, Result};

/// One outbound API call.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// JSON body, sent with `Content-Type: application/json`
    pub body: Option<serde_json::Value>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(Method::POST, url)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A fully read response. Non-`401` statuses, including errors, are returned as-is.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Validation(format!("response body is not valid JSON: {e}")))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct RequestDispatcher {
    client: reqwest::Client,
    coordinator: Arc<SessionCoordinator>,
}

impl RequestDispatcher {
    pub fn new(client: reqwest::Client, coordinator: Arc<SessionCoordinator>) -> Self {
        Self {
            client,
            coordinator,
        }
    }

    /// Send with the current access token, retrying once after a forced
    /// refresh if the server answers `401`.
    pub async fn send(&self, req: &RequestSpec) -> Result<ApiResponse> {
        let token = self.coordinator.access_token().await?;
        let response = self.execute(req, &token).await?;
        if response.status != 401 {
            return Ok(response);
        }

        info!(url = %req.url, "request unauthorized, refreshing token and retrying once");
        crate::metrics::record_request_retry();
        let token = self.coordinator.force_refresh(&token).await?;

        let response = self.execute(req, &token).await?;
        if response.status == 401 {
            warn!(url = %req.url, "request still unauthorized after refresh");
            return Err(Error::Authentication(format!(
                "{} {} rejected after token refresh",
                req.method, req.url
            )));
        }
        Ok(response)
    }

    /// Send every request concurrently. Results come back in input order;
    /// one failure does not affect the others.
    pub async fn send_all(&self, reqs: &[RequestSpec]) -> Vec<Result<ApiResponse>> {
        join_all(reqs.iter().map(|req| self.send(req))).await
    }

    async fn execute(&self, req: &RequestSpec, token: &str) -> Result<ApiResponse> {
        let mut request = self
            .client
            .request(req.method.clone(), &req.url)
            .bearer_auth(token);
        for (name, value) in &req.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &req.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} {} failed: {e}", req.method, req.url)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("reading response from {}: {e}", req.url)))?
            .to_vec();

        debug!(method = %req.method, url = %req.url, status, "api request completed");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
