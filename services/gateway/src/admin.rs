//! Operator endpoints
//!
//! Served on a separate listener so credential management and usage
//! statistics never share a port with proxied traffic. Credential
//! material is masked in every response; the raw value is write-only
//! through this surface.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use gateway_auth::{CredentialKind, CredentialRecord, CredentialStore, LoginFlow};
use gateway_limits::{SlidingWindowLimiter, UsageTracker};

/// Shared state for the operator router.
#[derive(Clone)]
pub struct AdminState {
    pub credentials: Arc<CredentialStore>,
    pub usage: Arc<UsageTracker>,
    pub credential_limiter: Arc<SlidingWindowLimiter>,
    pub domain_limiter: Arc<SlidingWindowLimiter>,
    pub client: reqwest::Client,
    /// Token endpoint used to finish browser logins; overridable so
    /// tests can point it at a local exchange server.
    pub token_endpoint: String,
    pub login_timeout_secs: u64,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/gateway/stats", get(stats_handler))
        .route("/gateway/stats/reset", post(reset_handler))
        .route(
            "/gateway/credentials",
            get(list_credentials).post(put_credential),
        )
        .route("/gateway/credentials/login", post(begin_login))
        .route("/gateway/credentials/{locator}", delete(delete_credential))
        .with_state(state)
}

/// Usage totals plus the live rate-limit windows.
async fn stats_handler(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "usage": state.usage.snapshot_json(),
        "rate_limits": {
            "credential": state.credential_limiter.snapshot().await,
            "domain": state.domain_limiter.snapshot().await,
        },
    }))
}

async fn reset_handler(State(state): State<AdminState>) -> StatusCode {
    state.usage.reset();
    info!("usage statistics reset by operator");
    StatusCode::NO_CONTENT
}

fn kind_label(kind: &CredentialKind) -> &'static str {
    match kind {
        CredentialKind::StaticKey => "static_key",
        CredentialKind::Oauth => "oauth",
    }
}

/// List stored credentials: locator, kind, and masked material only.
async fn list_credentials(State(state): State<AdminState>) -> Json<Value> {
    let mut locators = state.credentials.locators().await;
    locators.sort();

    let mut entries = Vec::with_capacity(locators.len());
    for locator in locators {
        if let Some(record) = state.credentials.get(&locator).await {
            entries.push(json!({
                "locator": locator,
                "kind": kind_label(&record.kind),
                "masked": record.masked(),
            }));
        }
    }
    Json(json!({"credentials": entries}))
}

#[derive(Debug, Deserialize)]
struct PutCredentialRequest {
    locator: String,
    key: String,
}

async fn put_credential(
    State(state): State<AdminState>,
    Json(body): Json<PutCredentialRequest>,
) -> Response {
    if body.locator.trim().is_empty() || body.key.trim().is_empty() {
        return admin_error(
            StatusCode::BAD_REQUEST,
            "locator and key must be non-empty",
        );
    }
    let record = CredentialRecord::static_key(body.key);
    let masked = record.masked();
    if let Err(e) = state.credentials.put(body.locator.clone(), record).await {
        return admin_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    info!(locator = body.locator, credential = masked, "stored static credential");
    (
        StatusCode::CREATED,
        Json(json!({"locator": body.locator, "masked": masked})),
    )
        .into_response()
}

/// Idempotent: deleting an absent locator is still 204.
async fn delete_credential(
    State(state): State<AdminState>,
    Path(locator): Path<String>,
) -> Response {
    match state.credentials.remove(&locator).await {
        Ok(removed) => {
            info!(locator, existed = removed.is_some(), "deleted credential");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => admin_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    locator: String,
}

/// Start a browser authorization for `locator`. Returns the URL the
/// operator must open; a background task waits for the callback and
/// persists the resulting token pair.
async fn begin_login(
    State(state): State<AdminState>,
    Json(body): Json<LoginRequest>,
) -> Response {
    if body.locator.trim().is_empty() {
        return admin_error(StatusCode::BAD_REQUEST, "locator must be non-empty");
    }
    let flow = match LoginFlow::begin().await {
        Ok(flow) => flow,
        Err(e) => return admin_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let authorization_url = flow.authorization_url.clone();

    let locator = body.locator.clone();
    tokio::spawn(async move {
        match flow
            .finish(&state.client, &state.token_endpoint, state.login_timeout_secs)
            .await
        {
            Ok(tokens) => {
                let record = CredentialRecord::oauth(tokens);
                let masked = record.masked();
                match state.credentials.put(locator.clone(), record).await {
                    Ok(()) => info!(locator, credential = masked, "login completed"),
                    Err(e) => warn!(locator, error = %e, "storing login result failed"),
                }
            }
            Err(e) => warn!(locator, error = %e, "login flow failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "locator": body.locator,
            "authorization_url": authorization_url,
        })),
    )
        .into_response()
}

fn admin_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": {"message": message}}))).into_response()
}
