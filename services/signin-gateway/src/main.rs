//! Sign-in gateway
//!
//! Single-binary service that hosts one session coordinator per process:
//! 1. `/login` starts an authorization-code-with-PKCE flow and redirects to the provider
//! 2. `/callback` redeems the code and resumes the in-app path the flow started from
//! 3. `/api/*` is forwarded to the protected API with the session's bearer token
//! 4. `/logout` clears local state, then redirects to the provider's end-session endpoint
//!
//! The gateway is single-user. There is one coordinator and one session per
//! process, not per browser: every client's `/api/*` call uses whichever
//! identity signed in last, and any client's `/logout` ends the session for
//! all of them. Run it in front of one user's workstation or tool, not as a
//! shared login service.

mod api;
mod config;
mod error;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use oauth_pkce::{FileKeyStore, HttpTokenEndpoint};
use serde::Deserialize;
use session::navigation::{self, Navigation, Navigator};
use session::{CallbackParams, RequestDispatcher, SessionCoordinator, SignInOptions};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use crate::api::ApiState;
use crate::config::Config;
use crate::error::{ApiError, error_response};

/// Time allowed for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    coordinator: Arc<SessionCoordinator>,
    api: ApiState,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Navigation sink for a server host.
///
/// Handlers turn the coordinator's navigations into HTTP redirects
/// themselves, so the navigator only records that one happened.
struct RedirectNavigator;

impl Navigator for RedirectNavigator {
    fn push_history(&self, path: &str) {
        debug!(path, "in-app navigation");
    }

    fn notify_location_changed(&self) {}

    fn assign(&self, url: &str) {
        debug!(url, "external navigation");
    }
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/login", get(login_handler))
        .route("/callback", get(callback_handler))
        .route("/logout", get(logout_handler))
        .route("/session", get(session_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting signin-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let client_config = config.client_config();
    client_config
        .validate()
        .context("invalid client configuration")?;
    let endpoints = client_config.endpoints()?;
    let app_origin = Url::parse(&config.server.app_origin)
        .with_context(|| format!("invalid app_origin {}", config.server.app_origin))?;

    info!(
        listen_addr = %config.server.listen_addr,
        authorize_endpoint = %endpoints.authorize,
        upstream_url = %config.api.upstream_url,
        storage_path = %config.session.storage_path.display(),
        confidential_client = config.client.client_secret.is_some(),
        "configuration loaded"
    );

    let store = FileKeyStore::open(config.session.storage_path.clone()).with_context(|| {
        format!(
            "failed to open key store at {}",
            config.session.storage_path.display()
        )
    })?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.api.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let mut token_endpoint = HttpTokenEndpoint::new(
        http.clone(),
        endpoints.token.clone(),
        client_config.client_id.clone(),
    );
    if let Some(secret) = config.client.client_secret.take() {
        token_endpoint = token_endpoint.with_client_secret(secret);
    }

    let coordinator = Arc::new(SessionCoordinator::new(
        client_config,
        app_origin,
        Arc::new(store),
        Arc::new(token_endpoint),
        Arc::new(RedirectNavigator),
    ));
    info!(state = ?coordinator.state(), "session coordinator ready");

    let app_state = AppState {
        api: ApiState {
            dispatcher: Arc::new(RequestDispatcher::new(http, coordinator.clone())),
            upstream_url: config.api.upstream_url.clone(),
        },
        coordinator,
        prometheus,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    /// In-app path to resume after the callback
    return_to: Option<String>,
    prompt: Option<String>,
    login_hint: Option<String>,
}

/// Start a sign-in and redirect the browser to the authorize endpoint.
async fn login_handler(
    State(state): State<AppState>,
    Query(params): Query<LoginParams>,
) -> Result<Response, ApiError> {
    let return_to = match params.return_to {
        Some(target) => match navigation::resolve(state.coordinator.app_origin(), &target) {
            Navigation::InApp { path } => Some(path),
            Navigation::External { url } => {
                return Err(ApiError(session::Error::Validation(format!(
                    "return_to must stay on this origin: {url}"
                ))));
            }
        },
        None => None,
    };

    let request = state.coordinator.start_sign_in(SignInOptions {
        state: return_to,
        prompt: params.prompt,
        login_hint: params.login_hint,
        extra_params: Vec::new(),
    })?;
    let url = request.to_url().map_err(session::Error::from)?;
    Ok(Redirect::to(&url).into_response())
}

/// Redeem the authorization code and resume the path the flow started from.
async fn callback_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let params = CallbackParams::from_query(query.as_deref().unwrap_or_default());
    let outcome = state.coordinator.complete_sign_in(params).await?;

    let resume = outcome
        .caller_state
        .map(|target| navigation::resolve(state.coordinator.app_origin(), &target));
    let target = match resume {
        Some(Navigation::InApp { path }) => path,
        _ => "/".to_string(),
    };
    Ok(Redirect::to(&target).into_response())
}

/// Sign out locally, then hand the browser to the end-session endpoint if configured.
async fn logout_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.coordinator.sign_out()? {
        Some(url) => Ok(Redirect::to(&url).into_response()),
        None => Ok(json_response(
            StatusCode::OK,
            serde_json::json!({ "status": "signed_out" }),
        )),
    }
}

/// Current session summary. Never includes token values.
async fn session_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let info = state.coordinator.session_info()?;
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({
            "state": state.coordinator.state(),
            "signed_in": info.is_some(),
            "session": info,
        }),
    ))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "auth_state": state.coordinator.state(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Forward `/api/*` to the protected API; everything else is 404.
async fn fallback_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    if api::is_api_path(request.uri().path()) {
        return api::forward(&state.api, request).await;
    }
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        &format!("no route for {}", request.uri().path()),
    )
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
