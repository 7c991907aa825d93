//! OAuth token exchange and refresh
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (completes the operator login flow)
//! 2. Token refresh (request-time and background refresh)
//!
//! Both operations POST form-encoded grants. The endpoint is a
//! parameter so the credential store can point refreshes at a local
//! server under test; production callers pass `constants::TOKEN_ENDPOINT`.

use serde::{Deserialize, Serialize};

use crate::constants::OAUTH_CLIENT_ID;
use crate::error::{Error, Result};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute unix millisecond timestamp when storing
/// the credential.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    /// Space-separated granted scopes, when the server reports them
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Granted scopes as a list, empty when the server omitted them.
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// Exchange an authorization code for tokens (login flow completion).
///
/// The operator has authorized in their browser and the loopback
/// listener received the authorization code. The PKCE verifier proves
/// this process initiated the flow.
pub async fn exchange_code(
    client: &reqwest::Client,
    endpoint: &str,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("client_id", OAUTH_CLIENT_ID),
            ("redirect_uri", redirect_uri),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))
}

/// Refresh an access token using a refresh token.
///
/// Called at request time (when the token is within the expiry skew)
/// and by the background refresh task.
pub async fn refresh_token(
    client: &reqwest::Client,
    endpoint: &str,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", OAUTH_CLIENT_ID),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 401/403 means the refresh token is revoked or invalid
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use serde_json::json;

    async fn spawn_token_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1/oauth/token")
    }

    #[test]
    fn token_response_deserializes_with_scope() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":3600,"scope":"user:profile user:inference"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.refresh_token, "rt_def");
        assert_eq!(token.expires_in, 3600);
        assert_eq!(token.scopes(), vec!["user:profile", "user:inference"]);
    }

    #[test]
    fn token_response_tolerates_missing_scope() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert!(token.scopes().is_empty());
    }

    #[tokio::test]
    async fn refresh_parses_successful_response() {
        let endpoint = spawn_token_server(Router::new().route(
            "/v1/oauth/token",
            post(|| async {
                Json(json!({
                    "access_token": "at_new",
                    "refresh_token": "rt_new",
                    "expires_in": 3600,
                    "scope": "user:inference",
                }))
            }),
        ))
        .await;

        let client = reqwest::Client::new();
        let token = refresh_token(&client, &endpoint, "rt_old").await.unwrap();
        assert_eq!(token.access_token, "at_new");
        assert_eq!(token.refresh_token, "rt_new");
    }

    #[tokio::test]
    async fn refresh_maps_401_to_invalid_credentials() {
        let endpoint = spawn_token_server(Router::new().route(
            "/v1/oauth/token",
            post(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    r#"{"error":"invalid_grant"}"#,
                )
            }),
        ))
        .await;

        let client = reqwest::Client::new();
        let result = refresh_token(&client, &endpoint, "rt_revoked").await;
        assert!(matches!(result, Err(Error::InvalidCredentials(_))));
    }

    #[tokio::test]
    async fn exchange_surfaces_server_error_body() {
        let endpoint = spawn_token_server(Router::new().route(
            "/v1/oauth/token",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    r#"{"error":"invalid_request"}"#,
                )
            }),
        ))
        .await;

        let client = reqwest::Client::new();
        let result = exchange_code(
            &client,
            &endpoint,
            "bad-code",
            "verifier",
            "http://localhost:1/callback",
        )
        .await;
        match result {
            Err(Error::TokenExchange(msg)) => assert!(msg.contains("invalid_request")),
            other => panic!("expected TokenExchange error, got {other:?}"),
        }
    }
}
