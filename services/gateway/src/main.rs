//! Messages gateway
//!
//! Single-binary multi-tenant gateway in front of an upstream LLM
//! messages API:
//! 1. Routes each caller hostname to a stored credential
//! 2. Admits requests through credential- and domain-scoped limits
//! 3. Forwards in passthrough or translation mode
//! 4. Meters token usage and serves operator endpoints on a second
//!    listener

mod admin;
mod classify;
mod config;
mod error;
mod metrics;
mod proxy;
mod router;
mod store;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use gateway_auth::{CredentialStore, TOKEN_ENDPOINT, spawn_refresh_task};
use gateway_limits::{SlidingWindowLimiter, UsageTracker, spawn_report_task};

use crate::admin::AdminState;
use crate::config::Config;
use crate::metrics::GatewayMetrics;
use crate::proxy::{ProxyState, TranslationTarget};
use crate::router::DomainRouter;
use crate::store::{LogNotifier, LogStore};

/// Grace period for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: GatewayMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`; excess
/// requests queue rather than fail.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
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

    info!("starting messages-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.gateway.listen_addr,
        admin_listen_addr = %config.gateway.admin_listen_addr,
        upstream_url = %config.gateway.upstream_url,
        mode = config.gateway.mode.label(),
        domains = config.domains.len(),
        "configuration loaded"
    );

    let credentials = Arc::new(
        CredentialStore::load(config.credentials.file.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to load credentials from {}",
                    config.credentials.file.display()
                )
            })?
            .with_refresh_skew_ms(config.credentials.refresh_skew_secs * 1000),
    );
    info!(credentials = credentials.len().await, "credential store loaded");

    let refresh_handle = spawn_refresh_task(
        credentials.clone(),
        Duration::from_secs(config.credentials.refresh_interval_secs),
    );

    let credential_limiter = Arc::new(SlidingWindowLimiter::new(config.rate_limit.limiter_config()));
    let domain_limiter = Arc::new(SlidingWindowLimiter::new(config.rate_limit.limiter_config()));

    let usage = Arc::new(UsageTracker::new());
    let report_handle = spawn_report_task(
        usage.clone(),
        Duration::from_secs(config.usage.report_interval_secs),
    );

    let default_key = config
        .credentials
        .default_key
        .as_ref()
        .map(|secret| secret.expose().to_string());
    let domain_router = DomainRouter::new(config.domains.clone(), default_key.is_some());

    let translation = config.translation.as_ref().map(|t| TranslationTarget {
        url: t.chat_completions_url.clone(),
        config: t.translator_config(),
    });

    let gateway_metrics = GatewayMetrics::new();

    let proxy_state = ProxyState {
        client: reqwest::Client::new(),
        upstream_url: config.gateway.upstream_url.clone(),
        mode: config.gateway.mode,
        translation,
        credentials: credentials.clone(),
        router: domain_router,
        default_key,
        credential_limiter: credential_limiter.clone(),
        domain_limiter: domain_limiter.clone(),
        usage: usage.clone(),
        store: Arc::new(LogStore),
        notifier: Arc::new(LogNotifier),
        timeout: Duration::from_secs(config.gateway.timeout_secs),
        requests_total: gateway_metrics.requests_total.clone(),
        errors_total: gateway_metrics.errors_total.clone(),
        in_flight: gateway_metrics.in_flight.clone(),
    };

    // Operator endpoints live on their own listener so they are never
    // exposed alongside proxied traffic.
    let admin_state = AdminState {
        credentials: credentials.clone(),
        usage: usage.clone(),
        credential_limiter,
        domain_limiter,
        client: reqwest::Client::new(),
        token_endpoint: TOKEN_ENDPOINT.to_string(),
        login_timeout_secs: config.credentials.login_timeout_secs,
    };
    let admin_listener = TcpListener::bind(config.gateway.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.gateway.admin_listen_addr))?;
    info!(addr = %config.gateway.admin_listen_addr, "operator endpoints ready");
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(admin_listener, admin::build_admin_router(admin_state)).await {
            error!(error = %e, "admin listener failed");
        }
    });

    let app_state = AppState {
        proxy: proxy_state,
        metrics: gateway_metrics.clone(),
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state, config.gateway.max_connections);

    let listener = TcpListener::bind(config.gateway.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.gateway.listen_addr))?;
    info!(addr = %config.gateway.listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = gateway_metrics.in_flight.clone();

    // Graceful shutdown with drain timeout enforcement:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. DRAIN_TIMEOUT caps the drain so a slow client cannot block exit
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

    // The drain timer starts at signal receipt, not server start
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    refresh_handle.abort();
    report_handle.abort();
    admin_handle.abort();

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status, mode, uptime, request counters, and the
/// stored credentials as locator → masked value. Raw key material
/// never appears here.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    let mut masked = serde_json::Map::new();
    for locator in state.proxy.credentials.locators().await {
        if let Some(record) = state.proxy.credentials.get(&locator).await {
            masked.insert(locator, serde_json::Value::String(record.masked()));
        }
    }

    let body = serde_json::json!({
        "status": "healthy",
        "mode": state.proxy.mode.label(),
        "upstream_url": state.proxy.upstream_url,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "credentials": masked,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint — returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies all non-operational requests upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use gateway_auth::CredentialRecord;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::config::Mode;

    /// PrometheusHandle for tests without installing the global
    /// recorder; avoids the "recorder already installed" panic across
    /// tests in one process.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    async fn test_app_state(upstream_url: &str, dir: &tempfile::TempDir) -> AppState {
        let credentials = Arc::new(
            CredentialStore::load(dir.path().join("credentials.json"))
                .await
                .unwrap(),
        );
        credentials
            .put(
                "team-a".into(),
                CredentialRecord::static_key("sk-ant-REDACTED"),
            )
            .await
            .unwrap();

        let gateway_metrics = GatewayMetrics::new();
        let mappings = std::collections::HashMap::from([(
            "team-a.example.com".to_string(),
            "team-a".to_string(),
        )]);

        AppState {
            proxy: ProxyState {
                client: reqwest::Client::new(),
                upstream_url: upstream_url.to_string(),
                mode: Mode::Passthrough,
                translation: None,
                credentials,
                router: DomainRouter::new(mappings, false),
                default_key: None,
                credential_limiter: Arc::new(SlidingWindowLimiter::new(Default::default())),
                domain_limiter: Arc::new(SlidingWindowLimiter::new(Default::default())),
                usage: Arc::new(UsageTracker::new()),
                store: Arc::new(LogStore),
                notifier: Arc::new(LogNotifier),
                timeout: Duration::from_secs(5),
                requests_total: gateway_metrics.requests_total.clone(),
                errors_total: gateway_metrics.errors_total.clone(),
                in_flight: gateway_metrics.in_flight.clone(),
            },
            metrics: gateway_metrics,
            prometheus: test_prometheus_handle(),
        }
    }

    /// Mock upstream that echoes request headers and body as JSON.
    async fn start_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let app =
                axum::Router::new().fallback(|request: axum::http::Request<Body>| async move {
                    let mut headers_map = serde_json::Map::new();
                    for (name, value) in request.headers() {
                        headers_map.insert(
                            name.to_string(),
                            serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                        );
                    }
                    let path = request.uri().path().to_string();
                    let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                        .await
                        .unwrap();
                    axum::Json(json!({
                        "type": "message",
                        "role": "assistant",
                        "content": [{"type": "text", "text": "ok"}],
                        "usage": {"input_tokens": 3, "output_tokens": 1},
                        "echoed_headers": headers_map,
                        "path": path,
                        "body": String::from_utf8_lossy(&body_bytes),
                    }))
                });
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}")
    }

    fn messages_request(host: &str) -> Request<Body> {
        Request::builder()
            .uri("/v1/messages")
            .method("POST")
            .header("host", host)
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "model": "native-model",
                    "max_tokens": 64,
                    "messages": [{"role": "user", "content": "hello"}],
                })
                .to_string(),
            ))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_mode_and_masked_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_app_state("http://unused.invalid", &dir).await;
        state.metrics.requests_total.fetch_add(5, Ordering::Relaxed);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["mode"], "passthrough");
        assert_eq!(json["requests_served"], 5);
        assert!(json["uptime_seconds"].is_u64());

        // Credential material appears masked only
        let masked = json["credentials"]["team-a"].as_str().unwrap();
        assert!(!masked.contains("sk-ant-api03-team-a"));
        assert!(!json.to_string().contains("sk-ant-api03-team-a-key"));
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_app_state("http://unused.invalid", &dir).await;
        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn fallback_proxies_with_injected_credential() {
        let upstream_url = start_echo_server().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let dir = tempfile::tempdir().unwrap();
        let state = test_app_state(&upstream_url, &dir).await;
        let app = build_router(state, 1000);

        let response = app
            .oneshot(messages_request("team-a.example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["path"], "/v1/messages");
        assert_eq!(
            json["echoed_headers"]["x-api-key"],
            "sk-ant-REDACTED"
        );
        // The caller's host header names the gateway, not the upstream
        let echoed_host = json["echoed_headers"]["host"].as_str().unwrap();
        assert!(!echoed_host.contains("team-a.example.com"));
    }

    #[tokio::test]
    async fn error_response_carries_generated_request_id() {
        let dir = tempfile::tempdir().unwrap();
        // Unroutable upstream triggers the error path
        let state = test_app_state("http://127.0.0.1:1", &dir).await;
        let app = build_router(state, 1000);

        let response = app
            .oneshot(messages_request("team-a.example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "upstream_error");
        let request_id = json["error"]["request_id"].as_str().unwrap();
        assert!(request_id.starts_with("req_"), "got: {request_id}");
    }

    #[tokio::test]
    async fn counters_track_requests_and_in_flight_drain() {
        let upstream_url = start_echo_server().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let dir = tempfile::tempdir().unwrap();
        let state = test_app_state(&upstream_url, &dir).await;
        let requests_total = state.metrics.requests_total.clone();
        let in_flight = state.metrics.in_flight.clone();
        let app = build_router(state, 1000);

        assert_eq!(requests_total.load(Ordering::Relaxed), 0);
        let response = app
            .oneshot(messages_request("team-a.example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(requests_total.load(Ordering::Relaxed), 1);
        assert_eq!(
            in_flight.load(Ordering::Relaxed),
            0,
            "in_flight must return to 0 after the request completes"
        );
    }
}
