//! Per-request orchestration
//!
//! Receives an inbound request, resolves the hostname's credential,
//! classifies the body, admits it through both rate limiters, then
//! dispatches in the configured mode: passthrough (forward the native
//! wire format unchanged, observing it for metering) or translation
//! (rewrite into the chat-completion protocol and back). After the
//! upstream call completes, token usage is metered into the limiters
//! and the usage tracker, and the exchange is handed to the storage
//! and notification collaborators (spawned, log-and-forget).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderValue, Method, StatusCode, Uri, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use common::mask_credential;
use gateway_auth::{ANTHROPIC_VERSION, AuthValue, CredentialStore, OAUTH_BETA_HEADER};
use gateway_limits::{Decision, SlidingWindowLimiter, UsageTracker};
use gateway_translate::{Frame, FrameParser, StreamTranslator, translate_request, translate_response};

use crate::classify::{RequestType, classify};
use crate::config::Mode;
use crate::error::{GatewayError, error_response};
use crate::metrics;
use crate::router::{DomainRouter, Route};
use crate::store::{NotificationEvent, Notifier, RequestStore, ResponseRecord};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound body cap.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Limiter scope for requests forwarded without a credential.
const ANONYMOUS_SCOPE: &str = "anonymous";

/// Translation-mode upstream endpoint and model selection.
#[derive(Clone)]
pub struct TranslationTarget {
    pub url: String,
    pub config: gateway_translate::TranslationConfig,
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub mode: Mode,
    pub translation: Option<TranslationTarget>,
    pub credentials: Arc<CredentialStore>,
    pub router: DomainRouter,
    pub default_key: Option<String>,
    pub credential_limiter: Arc<SlidingWindowLimiter>,
    pub domain_limiter: Arc<SlidingWindowLimiter>,
    pub usage: Arc<UsageTracker>,
    pub store: Arc<dyn RequestStore>,
    pub notifier: Arc<dyn Notifier>,
    pub timeout: Duration,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Inbound request after decoding. The classification is computed once
/// at construction; everything downstream reads the memoized value.
struct ProxyRequest {
    hostname: String,
    request_id: String,
    body: Value,
    /// Original bytes, forwarded verbatim in passthrough mode.
    raw: Bytes,
    request_type: RequestType,
}

impl ProxyRequest {
    fn new(hostname: String, request_id: String, raw: Bytes, body: Value) -> Self {
        let request_type = classify(&body);
        Self {
            hostname,
            request_id,
            body,
            raw,
            request_type,
        }
    }

    fn model(&self) -> &str {
        self.body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    fn wants_stream(&self) -> bool {
        self.body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Credential resolved for one request, with its limiter scope key.
/// `masked` never contains raw key material.
#[derive(Clone)]
struct ResolvedAuth {
    value: Option<AuthValue>,
    masked: String,
}

impl ResolvedAuth {
    fn anonymous() -> Self {
        Self {
            value: None,
            masked: ANONYMOUS_SCOPE.to_string(),
        }
    }
}

struct InFlightGuard(Arc<AtomicU64>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Orchestrate one inbound request end to end.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    state.in_flight.fetch_add(1, Ordering::Relaxed);
    let _guard = InFlightGuard(state.in_flight.clone());

    // Strip the port and lowercase once; limiter and usage keys share
    // the normalized form.
    let hostname = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let inbound_headers = request.headers().clone();

    let raw = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            return fail(
                state,
                GatewayError::InvalidRequest(format!("unreadable request body: {e}")),
                &request_id,
                started,
            );
        }
    };
    let body: Value = match serde_json::from_slice(&raw) {
        Ok(v) => v,
        Err(e) => {
            return fail(
                state,
                GatewayError::InvalidRequest(format!("request body is not valid JSON: {e}")),
                &request_id,
                started,
            );
        }
    };
    let proxied = ProxyRequest::new(hostname, request_id, raw, body);

    let auth = match resolve_auth(state, &proxied.hostname).await {
        Ok(auth) => auth,
        Err(e) => return fail(state, e, &proxied.request_id, started),
    };

    // Two independent admissions: credential scope, then domain scope.
    if let Decision::Rejected { retry_after } = state.credential_limiter.check(&auth.masked).await {
        metrics::record_rate_limited("credential");
        return fail(
            state,
            GatewayError::RateLimitExceeded { retry_after },
            &proxied.request_id,
            started,
        );
    }
    if let Decision::Rejected { retry_after } = state.domain_limiter.check(&proxied.hostname).await
    {
        metrics::record_rate_limited("domain");
        return fail(
            state,
            GatewayError::RateLimitExceeded { retry_after },
            &proxied.request_id,
            started,
        );
    }

    hand_off_request(state, &proxied);

    let result = match state.mode {
        Mode::Passthrough => {
            passthrough(state, &proxied, &auth, method, &uri, &inbound_headers, started).await
        }
        Mode::Translation => translate_dispatch(state, &proxied, &auth, started).await,
    };

    match result {
        Ok(response) => {
            metrics::record_request(
                response.status().as_u16(),
                state.mode.label(),
                started.elapsed().as_secs_f64(),
            );
            response
        }
        Err(e) => fail(state, e, &proxied.request_id, started),
    }
}

/// Render a taxonomy error and account for it.
fn fail(state: &ProxyState, err: GatewayError, request_id: &str, started: Instant) -> Response {
    state.errors_total.fetch_add(1, Ordering::Relaxed);
    let status = err.status();
    metrics::record_request(
        status.as_u16(),
        state.mode.label(),
        started.elapsed().as_secs_f64(),
    );
    hand_off_response(
        state,
        ResponseRecord {
            request_id: request_id.to_string(),
            status: status.as_u16(),
            body: None,
            is_streaming: false,
            duration_ms: started.elapsed().as_millis() as u64,
            input_tokens: 0,
            output_tokens: 0,
            tool_call_count: 0,
            error: Some(err.error_type().to_string()),
        },
    );
    warn!(request_id, error = %err, "request failed");
    err.into_response(request_id)
}

/// Route the hostname and turn the outcome into an upstream auth value.
///
/// A mapped locator whose record is missing or malformed downgrades to
/// unauthenticated forwarding (the upstream rejects it itself); a
/// failed OAuth refresh fails the request fast instead, since sending
/// a known-expired token would only produce a confusing upstream 401.
async fn resolve_auth(state: &ProxyState, hostname: &str) -> Result<ResolvedAuth, GatewayError> {
    match state.router.route(hostname) {
        Route::Credential(locator) => match state.credentials.bearer_value(&locator).await {
            Ok(value) => {
                let masked = match &value {
                    AuthValue::ApiKey(key) => mask_credential(key),
                    AuthValue::Bearer(token) => mask_credential(token),
                };
                Ok(ResolvedAuth {
                    value: Some(value),
                    masked,
                })
            }
            Err(gateway_auth::Error::RefreshFailed(msg)) => {
                Err(GatewayError::CredentialRefreshFailed(msg))
            }
            Err(gateway_auth::Error::InvalidCredentials(msg)) => {
                Err(GatewayError::CredentialRefreshFailed(msg))
            }
            Err(e) => {
                warn!(hostname, locator, error = %e, "mapped credential unusable, forwarding unauthenticated");
                Ok(ResolvedAuth::anonymous())
            }
        },
        Route::DefaultKey => {
            let key = state.default_key.as_deref().ok_or_else(|| {
                GatewayError::CredentialUnavailable("default key route without a key".into())
            })?;
            Ok(ResolvedAuth {
                value: Some(AuthValue::ApiKey(key.to_string())),
                masked: mask_credential(key),
            })
        }
        Route::Unauthenticated => {
            debug!(hostname, "no credential mapping, forwarding unauthenticated");
            Ok(ResolvedAuth::anonymous())
        }
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Build outbound headers for the native upstream: inbound headers
/// minus hop-by-hop, host, and any caller-supplied credentials, plus
/// the pinned API version and the resolved credential's header form.
fn native_upstream_headers(
    inbound: &axum::http::HeaderMap,
    auth: &ResolvedAuth,
) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in inbound {
        let n = name.as_str();
        if is_hop_by_hop(n)
            || n.eq_ignore_ascii_case("host")
            || n.eq_ignore_ascii_case("authorization")
            || n.eq_ignore_ascii_case("x-api-key")
            || n.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
    match &auth.value {
        Some(AuthValue::Bearer(token)) => {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(v) => {
                    headers.insert(header::AUTHORIZATION, v);
                    headers.insert("anthropic-beta", HeaderValue::from_static(OAUTH_BETA_HEADER));
                }
                Err(e) => warn!(error = %e, "skipping malformed bearer token header"),
            }
        }
        Some(AuthValue::ApiKey(key)) => match HeaderValue::from_str(key) {
            Ok(v) => {
                headers.insert("x-api-key", v);
            }
            Err(e) => warn!(error = %e, "skipping malformed api key header"),
        },
        None => {}
    }
    headers
}

/// Forward to the native upstream, observing the reply for metering.
async fn passthrough(
    state: &ProxyState,
    proxied: &ProxyRequest,
    auth: &ResolvedAuth,
    method: Method,
    uri: &Uri,
    inbound_headers: &axum::http::HeaderMap,
    started: Instant,
) -> Result<Response, GatewayError> {
    let upstream_url = if let Some(pq) = uri.path_and_query() {
        format!("{}{}", state.upstream_url.trim_end_matches('/'), pq)
    } else {
        state.upstream_url.clone()
    };
    let headers = native_upstream_headers(inbound_headers, auth);

    let upstream = state
        .client
        .request(method, &upstream_url)
        .headers(headers)
        .timeout(state.timeout)
        .body(proxied.raw.clone())
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                metrics::record_upstream_error("timeout");
                GatewayError::UpstreamTimeout(state.timeout.as_secs())
            } else {
                metrics::record_upstream_error("connection");
                GatewayError::UpstreamError(e.to_string())
            }
        })?;

    let status = upstream.status();
    let is_event_stream = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if proxied.wants_stream() && status.is_success() && is_event_stream {
        return passthrough_stream(state, proxied, auth, upstream, started);
    }

    let resp_headers = upstream.headers().clone();
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamError(format!("reading upstream body: {e}")))?;

    // Non-2xx passes through verbatim; only successful replies are metered.
    if status.is_success() {
        let parsed: Option<Value> = serde_json::from_slice(&bytes).ok();
        let (input, output, tools, text) = parsed
            .as_ref()
            .map(extract_native_usage)
            .unwrap_or_default();
        meter(state, &auth.masked, &proxied.hostname, input, output).await;
        hand_off_response(
            state,
            ResponseRecord {
                request_id: proxied.request_id.clone(),
                status: status.as_u16(),
                body: parsed,
                is_streaming: false,
                duration_ms: started.elapsed().as_millis() as u64,
                input_tokens: input,
                output_tokens: output,
                tool_call_count: tools,
                error: None,
            },
        );
        hand_off_notification(
            state,
            NotificationEvent {
                masked_credential: auth.masked.clone(),
                domain: proxied.hostname.clone(),
                model: proxied.model().to_string(),
                role: "assistant".to_string(),
                content: text,
                input_tokens: input,
                output_tokens: output,
            },
        );
    } else {
        metrics::record_upstream_error("status");
        state.errors_total.fetch_add(1, Ordering::Relaxed);
        hand_off_response(
            state,
            ResponseRecord {
                request_id: proxied.request_id.clone(),
                status: status.as_u16(),
                body: serde_json::from_slice(&bytes).ok(),
                is_streaming: false,
                duration_ms: started.elapsed().as_millis() as u64,
                input_tokens: 0,
                output_tokens: 0,
                tool_call_count: 0,
                error: Some("upstream_error".to_string()),
            },
        );
    }

    let mut response = Response::builder().status(status);
    for (name, value) in &resp_headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response.body(Body::from(bytes)).map_err(|e| {
        GatewayError::UpstreamError(format!("assembling client response: {e}"))
    })
}

/// Forward a streaming reply byte-identical while a side channel parses
/// each event frame for usage totals and ordered chunk archiving. Frame
/// parse failures never interrupt the client-facing byte stream.
fn passthrough_stream(
    state: &ProxyState,
    proxied: &ProxyRequest,
    auth: &ResolvedAuth,
    upstream: reqwest::Response,
    started: Instant,
) -> Result<Response, GatewayError> {
    let status = upstream.status();
    let resp_headers = upstream.headers().clone();

    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(32);
    let task_state = state.clone();
    let request_id = proxied.request_id.clone();
    let hostname = proxied.hostname.clone();
    let model = proxied.model().to_string();
    let masked = auth.masked.clone();

    tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        let mut observer = NativeStreamObserver::default();
        let mut index: u64 = 0;
        let mut error: Option<String> = None;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    observer.observe(&bytes);
                    // Awaited in-line so chunk indices match arrival order.
                    if let Err(e) = task_state
                        .store
                        .store_streaming_chunk(request_id.clone(), index, bytes.to_vec())
                        .await
                    {
                        warn!(request_id, index, error = %e, "storage hand-off failed");
                    }
                    index += 1;
                    if tx.send(Ok(bytes)).await.is_err() {
                        // Client disconnected: abort the upstream read
                        // loop promptly. Stored chunks up to `index`
                        // make the partial stream detectable.
                        warn!(request_id, "client disconnected mid-stream");
                        error = Some("client_disconnect".to_string());
                        break;
                    }
                }
                Err(e) => {
                    warn!(request_id, error = %e, "upstream stream error");
                    error = Some(e.to_string());
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    break;
                }
            }
        }
        drop(tx);

        meter(
            &task_state,
            &masked,
            &hostname,
            observer.input_tokens,
            observer.output_tokens,
        )
        .await;
        hand_off_response(
            &task_state,
            ResponseRecord {
                request_id: request_id.clone(),
                status: status.as_u16(),
                body: None,
                is_streaming: true,
                duration_ms: started.elapsed().as_millis() as u64,
                input_tokens: observer.input_tokens,
                output_tokens: observer.output_tokens,
                tool_call_count: observer.tool_calls,
                error,
            },
        );
        hand_off_notification(
            &task_state,
            NotificationEvent {
                masked_credential: masked,
                domain: hostname,
                model,
                role: "assistant".to_string(),
                content: observer.text,
                input_tokens: observer.input_tokens,
                output_tokens: observer.output_tokens,
            },
        );
    });

    let body = Body::from_stream(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    let mut response = Response::builder().status(status);
    for (name, value) in &resp_headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response.body(body).map_err(|e| {
        GatewayError::UpstreamError(format!("assembling client response: {e}"))
    })
}

/// Rewrite into the chat-completion protocol, call that upstream, and
/// rewrite the reply back into the native protocol.
async fn translate_dispatch(
    state: &ProxyState,
    proxied: &ProxyRequest,
    auth: &ResolvedAuth,
    started: Instant,
) -> Result<Response, GatewayError> {
    let target = state.translation.as_ref().ok_or_else(|| {
        GatewayError::TranslationError("translation mode without a configured target".into())
    })?;
    let upstream_body = translate_request(&proxied.body, &target.config)
        .map_err(|e| GatewayError::TranslationError(e.to_string()))?;

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    // The chat-completion upstream authenticates with a bearer header
    // for both credential kinds.
    if let Some(AuthValue::Bearer(secret) | AuthValue::ApiKey(secret)) = &auth.value {
        match HeaderValue::from_str(&format!("Bearer {secret}")) {
            Ok(v) => {
                headers.insert(header::AUTHORIZATION, v);
            }
            Err(e) => warn!(error = %e, "skipping malformed credential header"),
        }
    }

    let upstream = state
        .client
        .post(&target.url)
        .headers(headers)
        .timeout(state.timeout)
        .json(&upstream_body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                metrics::record_upstream_error("timeout");
                GatewayError::UpstreamTimeout(state.timeout.as_secs())
            } else {
                metrics::record_upstream_error("connection");
                GatewayError::UpstreamError(e.to_string())
            }
        })?;

    let status = upstream.status();
    if !status.is_success() {
        metrics::record_upstream_error("status");
        state.errors_total.fetch_add(1, Ordering::Relaxed);
        let message = upstream.text().await.unwrap_or_default();
        // Keep the upstream's status so the caller sees the real failure.
        return Ok(error_response(
            status,
            "upstream_error",
            message.trim(),
            &proxied.request_id,
        ));
    }

    let is_event_stream = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if proxied.wants_stream() && is_event_stream {
        return translate_stream(state, proxied, auth, upstream, started);
    }

    let upstream_json: Value = upstream
        .json()
        .await
        .map_err(|e| GatewayError::UpstreamError(format!("reading upstream body: {e}")))?;
    let native = translate_response(&upstream_json, proxied.model())
        .map_err(|e| GatewayError::TranslationError(e.to_string()))?;

    let (input, output, tools, text) = extract_native_usage(&native);
    meter(state, &auth.masked, &proxied.hostname, input, output).await;
    hand_off_response(
        state,
        ResponseRecord {
            request_id: proxied.request_id.clone(),
            status: 200,
            body: Some(native.clone()),
            is_streaming: false,
            duration_ms: started.elapsed().as_millis() as u64,
            input_tokens: input,
            output_tokens: output,
            tool_call_count: tools,
            error: None,
        },
    );
    hand_off_notification(
        state,
        NotificationEvent {
            masked_credential: auth.masked.clone(),
            domain: proxied.hostname.clone(),
            model: proxied.model().to_string(),
            role: "assistant".to_string(),
            content: text,
            input_tokens: input,
            output_tokens: output,
        },
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(native.to_string()))
        .map_err(|e| GatewayError::TranslationError(format!("assembling client response: {e}")))
}

/// Drive the streaming state machine: upstream delta frames in, native
/// frames out, emitted as soon as derivable.
fn translate_stream(
    state: &ProxyState,
    proxied: &ProxyRequest,
    auth: &ResolvedAuth,
    upstream: reqwest::Response,
    started: Instant,
) -> Result<Response, GatewayError> {
    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(32);
    let task_state = state.clone();
    let request_id = proxied.request_id.clone();
    let hostname = proxied.hostname.clone();
    let model = proxied.model().to_string();
    let masked = auth.masked.clone();

    tokio::spawn(async move {
        let mut translator = StreamTranslator::new(model.clone());
        let mut stream = upstream.bytes_stream();
        let mut index: u64 = 0;
        let mut error: Option<String> = None;
        let mut client_gone = false;

        'upstream: while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(request_id, error = %e, "upstream stream error");
                    error = Some(e.to_string());
                    break;
                }
            };
            for frame in translator.feed(&bytes) {
                if let Err(e) = task_state
                    .store
                    .store_streaming_chunk(request_id.clone(), index, frame.clone().into_bytes())
                    .await
                {
                    warn!(request_id, index, error = %e, "storage hand-off failed");
                }
                index += 1;
                if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                    warn!(request_id, "client disconnected mid-stream");
                    error = Some("client_disconnect".to_string());
                    client_gone = true;
                    break 'upstream;
                }
            }
        }

        // Close out the native stream even if the upstream died mid-way,
        // so the client always sees a well-formed terminator.
        if !client_gone {
            for frame in translator.finish() {
                if let Err(e) = task_state
                    .store
                    .store_streaming_chunk(request_id.clone(), index, frame.clone().into_bytes())
                    .await
                {
                    warn!(request_id, index, error = %e, "storage hand-off failed");
                }
                index += 1;
                if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                    error = Some("client_disconnect".to_string());
                    break;
                }
            }
        }
        drop(tx);

        let input = translator.input_tokens();
        let output = translator.output_tokens();
        meter(&task_state, &masked, &hostname, input, output).await;
        hand_off_response(
            &task_state,
            ResponseRecord {
                request_id: request_id.clone(),
                status: 200,
                body: None,
                is_streaming: true,
                duration_ms: started.elapsed().as_millis() as u64,
                input_tokens: input,
                output_tokens: output,
                tool_call_count: translator.tool_call_count(),
                error,
            },
        );
        hand_off_notification(
            &task_state,
            NotificationEvent {
                masked_credential: masked,
                domain: hostname,
                model,
                role: "assistant".to_string(),
                content: translator.accumulated_text().to_string(),
                input_tokens: input,
                output_tokens: output,
            },
        );
    });

    let body = Body::from_stream(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| GatewayError::TranslationError(format!("assembling client response: {e}")))
}

/// Usage, tool count, and assembled text from a buffered native message.
fn extract_native_usage(message: &Value) -> (u64, u64, u64, String) {
    let input = message["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output = message["usage"]["output_tokens"].as_u64().unwrap_or(0);
    let mut tools = 0;
    let mut text = String::new();
    if let Some(blocks) = message["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("tool_use") => tools += 1,
                Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
                _ => {}
            }
        }
    }
    (input, output, tools, text)
}

/// Side-channel observer for native event streams. Extracts usage
/// totals, tool-call counts, and text without touching the byte pipe.
#[derive(Default)]
struct NativeStreamObserver {
    parser: FrameParser,
    input_tokens: u64,
    output_tokens: u64,
    tool_calls: u64,
    text: String,
}

impl NativeStreamObserver {
    fn observe(&mut self, chunk: &[u8]) {
        for frame in self.parser.feed(chunk) {
            let Frame::Data(payload) = frame else { continue };
            // A malformed frame is skipped; the stream stays untouched.
            let Ok(event) = serde_json::from_str::<Value>(&payload) else {
                debug!("skipping malformed stream frame");
                continue;
            };
            match event["type"].as_str() {
                Some("message_start") => {
                    if let Some(n) = event["message"]["usage"]["input_tokens"].as_u64() {
                        self.input_tokens = n;
                    }
                }
                Some("message_delta") => {
                    if let Some(n) = event["usage"]["output_tokens"].as_u64() {
                        self.output_tokens = n;
                    }
                }
                Some("content_block_start") => {
                    if event["content_block"]["type"].as_str() == Some("tool_use") {
                        self.tool_calls += 1;
                    }
                }
                Some("content_block_delta") => {
                    if event["delta"]["type"].as_str() == Some("text_delta") {
                        self.text
                            .push_str(event["delta"]["text"].as_str().unwrap_or(""));
                    }
                }
                _ => {}
            }
        }
    }
}

/// Account completed usage into both limiters and the usage tracker.
async fn meter(state: &ProxyState, scope_key: &str, hostname: &str, input: u64, output: u64) {
    let total = input + output;
    if total > 0 {
        state.credential_limiter.record_tokens(scope_key, total).await;
        state.domain_limiter.record_tokens(hostname, total).await;
    }
    state.usage.record(hostname, input, output);
}

fn hand_off_request(state: &ProxyState, proxied: &ProxyRequest) {
    let store = state.store.clone();
    let request_id = proxied.request_id.clone();
    let body = proxied.body.clone();
    let classification = proxied.request_type.label();
    let is_streaming = proxied.wants_stream();
    tokio::spawn(async move {
        if let Err(e) = store
            .store_request(request_id.clone(), body, classification, is_streaming)
            .await
        {
            warn!(request_id, error = %e, "storage hand-off failed");
        }
    });
}

fn hand_off_response(state: &ProxyState, record: ResponseRecord) {
    let store = state.store.clone();
    tokio::spawn(async move {
        let request_id = record.request_id.clone();
        if let Err(e) = store.store_response(record).await {
            warn!(request_id, error = %e, "storage hand-off failed");
        }
    });
}

fn hand_off_notification(state: &ProxyState, event: NotificationEvent) {
    let notifier = state.notifier.clone();
    tokio::spawn(async move {
        let domain = event.domain.clone();
        if let Err(e) = notifier.notify(event).await {
            warn!(domain, error = %e, "notification hand-off failed");
        }
    });
}
