//! Operator login flow
//!
//! One-time, operator-invoked authorization. Not part of the request
//! hot path. `LoginFlow::begin` binds a loopback callback listener and
//! builds the authorization URL; the operator opens it in a browser,
//! authorizes, and the authorization server redirects back to the
//! listener with `code` and `state`. `finish` waits for that redirect
//! (with a timeout, default 5 minutes), verifies the state, exchanges
//! the code, and returns the resulting token pair for persistence.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::credentials::{OAuthTokens, now_ms};
use crate::error::{Error, Result};
use crate::pkce;
use crate::token;

/// Default wait for the operator to complete authorization.
pub const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 300;

const SUCCESS_PAGE: &str = "<html><body><h2>Authorization complete</h2>\
<p>You can close this tab and return to the gateway.</p></body></html>";
const FAILURE_PAGE: &str = "<html><body><h2>Authorization failed</h2>\
<p>The callback was rejected. Check the gateway log.</p></body></html>";

/// An in-progress authorization: holds the PKCE verifier, the expected
/// state, and the bound callback listener.
pub struct LoginFlow {
    /// URL the operator must open in a browser.
    pub authorization_url: String,
    verifier: String,
    state: String,
    redirect_uri: String,
    listener: TcpListener,
}

impl LoginFlow {
    /// Bind a loopback listener on an ephemeral port and prepare the
    /// authorization URL.
    pub async fn begin() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Io(format!("binding callback listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Io(format!("reading callback listener address: {e}")))?
            .port();
        let redirect_uri = format!("http://localhost:{port}/callback");

        let verifier = pkce::generate_verifier();
        let challenge = pkce::compute_challenge(&verifier);
        let state = pkce::generate_state();
        let authorization_url = pkce::build_authorization_url(&redirect_uri, &state, &challenge);

        info!(port, "login callback listener ready");
        Ok(Self {
            authorization_url,
            verifier,
            state,
            redirect_uri,
            listener,
        })
    }

    /// Wait for the authorization redirect, then exchange the code.
    ///
    /// Rejects callbacks whose `state` does not match; times out after
    /// `timeout_secs`. On success returns a token pair with an absolute
    /// expiry, ready to store.
    pub async fn finish(
        self,
        client: &reqwest::Client,
        token_endpoint: &str,
        timeout_secs: u64,
    ) -> Result<OAuthTokens> {
        let code = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            wait_for_callback(&self.listener, &self.state),
        )
        .await
        .map_err(|_| Error::LoginTimeout(timeout_secs))??;

        let response = token::exchange_code(
            client,
            token_endpoint,
            &code,
            &self.verifier,
            &self.redirect_uri,
        )
        .await?;

        let scopes = response.scopes();
        Ok(OAuthTokens {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at_epoch_ms: now_ms() + response.expires_in * 1000,
            scopes,
            // Browser authorization goes through the subscription
            // surface, so the grant carries the plan tier.
            is_max: true,
        })
    }
}

/// Accept connections until one carries a valid `/callback` redirect.
///
/// Stray requests (favicon probes, health checks) get a 404 and the
/// loop keeps waiting. A state mismatch or an explicit `error`
/// parameter aborts the flow.
async fn wait_for_callback(listener: &TcpListener, expected_state: &str) -> Result<String> {
    loop {
        let (mut stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Io(format!("accepting callback connection: {e}")))?;

        let request_line = read_request_line(&mut stream).await?;
        let Some(query) = request_line
            .strip_prefix("GET /callback?")
            .and_then(|rest| rest.split_whitespace().next())
        else {
            respond(&mut stream, "404 Not Found", "not found").await;
            continue;
        };

        if let Some(error) = query_param(query, "error") {
            respond(&mut stream, "200 OK", FAILURE_PAGE).await;
            warn!(error, "authorization server reported an error");
            return Err(Error::TokenExchange(format!(
                "authorization denied: {error}"
            )));
        }

        let state = query_param(query, "state").unwrap_or_default();
        if state != expected_state {
            respond(&mut stream, "200 OK", FAILURE_PAGE).await;
            warn!("callback state mismatch, rejecting");
            return Err(Error::StateMismatch);
        }

        let Some(code) = query_param(query, "code") else {
            respond(&mut stream, "200 OK", FAILURE_PAGE).await;
            return Err(Error::TokenExchange("callback missing code".into()));
        };

        respond(&mut stream, "200 OK", SUCCESS_PAGE).await;
        return Ok(code);
    }
}

/// Read up to the end of the request headers and return the first line.
async fn read_request_line(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::Io(format!("reading callback request: {e}")))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 16 * 1024 {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    Ok(text.lines().next().unwrap_or_default().to_string())
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    // Best effort: the browser closing early is not an error worth surfacing
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Extract a single query parameter value (percent-decoding not needed:
/// codes and state values are URL-safe base64).
fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use serde_json::json;

    fn callback_port(flow: &LoginFlow) -> u16 {
        flow.listener.local_addr().unwrap().port()
    }

    async fn spawn_exchange_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route(
            "/v1/oauth/token",
            post(|| async {
                Json(json!({
                    "access_token": "at_login",
                    "refresh_token": "rt_login",
                    "expires_in": 3600,
                    "scope": "user:profile user:inference",
                }))
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1/oauth/token")
    }

    #[tokio::test]
    async fn begin_builds_loopback_redirect() {
        let flow = LoginFlow::begin().await.unwrap();
        let port = callback_port(&flow);
        assert_eq!(flow.redirect_uri, format!("http://localhost:{port}/callback"));
        assert!(flow.authorization_url.contains("code_challenge="));
        assert!(flow.authorization_url.contains(&flow.state));
    }

    #[tokio::test]
    async fn completes_on_valid_callback() {
        let endpoint = spawn_exchange_endpoint().await;
        let flow = LoginFlow::begin().await.unwrap();
        let port = callback_port(&flow);
        let state = flow.state.clone();

        tokio::spawn(async move {
            let client = reqwest::Client::new();
            // Simulated browser redirect from the authorization server
            let _ = client
                .get(format!(
                    "http://127.0.0.1:{port}/callback?code=auth-code-1&state={state}"
                ))
                .send()
                .await;
        });

        let client = reqwest::Client::new();
        let tokens = flow.finish(&client, &endpoint, 5).await.unwrap();
        assert_eq!(tokens.access_token, "at_login");
        assert_eq!(tokens.refresh_token, "rt_login");
        assert_eq!(tokens.scopes, vec!["user:profile", "user:inference"]);
        assert!(tokens.expires_at_epoch_ms > now_ms());
    }

    #[tokio::test]
    async fn rejects_state_mismatch() {
        let endpoint = spawn_exchange_endpoint().await;
        let flow = LoginFlow::begin().await.unwrap();
        let port = callback_port(&flow);

        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let _ = client
                .get(format!(
                    "http://127.0.0.1:{port}/callback?code=auth-code-1&state=forged"
                ))
                .send()
                .await;
        });

        let client = reqwest::Client::new();
        let result = flow.finish(&client, &endpoint, 5).await;
        assert!(matches!(result, Err(Error::StateMismatch)));
    }

    #[tokio::test]
    async fn ignores_stray_requests_until_callback() {
        let endpoint = spawn_exchange_endpoint().await;
        let flow = LoginFlow::begin().await.unwrap();
        let port = callback_port(&flow);
        let state = flow.state.clone();

        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let _ = client
                .get(format!("http://127.0.0.1:{port}/favicon.ico"))
                .send()
                .await;
            let _ = client
                .get(format!(
                    "http://127.0.0.1:{port}/callback?code=auth-code-2&state={state}"
                ))
                .send()
                .await;
        });

        let client = reqwest::Client::new();
        let tokens = flow.finish(&client, &endpoint, 5).await.unwrap();
        assert_eq!(tokens.access_token, "at_login");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_callback() {
        let flow = LoginFlow::begin().await.unwrap();
        let client = reqwest::Client::new();
        let result = flow.finish(&client, "http://127.0.0.1:1/unused", 1).await;
        assert!(matches!(result, Err(Error::LoginTimeout(1))));
    }
}
