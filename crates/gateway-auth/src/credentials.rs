//! Credential records and the credential file store
//!
//! Manages a JSON file mapping credential locators to records. A record
//! is either a static API key or an OAuth token pair. All writes use
//! atomic temp-file + rename to prevent corruption on crash. A tokio
//! Mutex serializes concurrent writes from request-time refresh and
//! background refresh.
//!
//! `bearer_value` is the hot-path entry point: static keys are returned
//! unchanged, OAuth tokens are refreshed first when they fall within
//! the configured skew of expiry. Refresh is single-flight per locator
//! so concurrent requests against an expiring credential produce
//! exactly one token exchange.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use common::mask_credential;

use crate::constants::TOKEN_ENDPOINT;
use crate::error::{Error, Result};
use crate::token;

/// Default margin before expiry at which a token is considered stale.
pub const DEFAULT_REFRESH_SKEW_MS: u64 = 60_000;

/// Discriminates the two credential shapes in the store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    StaticKey,
    Oauth,
}

/// OAuth token pair with absolute expiry and grant metadata.
///
/// `expires_at_epoch_ms` is a unix timestamp in milliseconds (absolute,
/// not a delta). Computed at storage time from `TokenResponse.expires_in`
/// (seconds delta) plus the current time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at_epoch_ms: u64,
    pub scopes: Vec<String>,
    /// Whether the grant belongs to a Max-tier subscription
    #[serde(default)]
    pub is_max: bool,
}

/// A single credential: exactly one of `key`/`oauth` is populated
/// according to `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub kind: CredentialKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthTokens>,
}

impl CredentialRecord {
    pub fn static_key(key: impl Into<String>) -> Self {
        Self {
            kind: CredentialKind::StaticKey,
            key: Some(key.into()),
            oauth: None,
        }
    }

    pub fn oauth(tokens: OAuthTokens) -> Self {
        Self {
            kind: CredentialKind::Oauth,
            key: None,
            oauth: Some(tokens),
        }
    }

    /// Masked form for logs and operator responses. Never returns raw
    /// key or token material.
    pub fn masked(&self) -> String {
        match self.kind {
            CredentialKind::StaticKey => self
                .key
                .as_deref()
                .map(mask_credential)
                .unwrap_or_else(|| "***".into()),
            CredentialKind::Oauth => self
                .oauth
                .as_ref()
                .map(|o| mask_credential(&o.access_token))
                .unwrap_or_else(|| "***".into()),
        }
    }
}

/// How the resolved credential is presented to the upstream API.
///
/// Static keys go in the raw key header; OAuth access tokens go in an
/// `Authorization: Bearer` header with the beta-feature marker.
#[derive(Debug, Clone)]
pub enum AuthValue {
    ApiKey(String),
    Bearer(String),
}

/// Thread-safe credential file manager.
///
/// The state Mutex serializes all writes. Reads acquire the lock
/// briefly to clone the record, so request-time reads don't block on
/// background persistence. `refresh_locks` holds one mutex per locator
/// for the single-flight refresh discipline.
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, CredentialRecord>>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    http: reqwest::Client,
    token_endpoint: String,
    refresh_skew_ms: u64,
}

impl CredentialStore {
    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with
    /// zero credentials). Requests against unmapped hostnames then fall
    /// back to the default key or proceed unauthenticated.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let records: HashMap<String, CredentialRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), credentials = records.len(), "loaded credentials");
            records
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let records = HashMap::new();
            // Create the empty file so future loads don't need the cold-start path
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
            refresh_locks: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            refresh_skew_ms: DEFAULT_REFRESH_SKEW_MS,
        })
    }

    /// Override the token endpoint (tests point this at a local server).
    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    /// Override the refresh skew.
    pub fn with_refresh_skew_ms(mut self, skew_ms: u64) -> Self {
        self.refresh_skew_ms = skew_ms;
        self
    }

    /// Get a clone of a specific credential record.
    pub async fn get(&self, locator: &str) -> Option<CredentialRecord> {
        let state = self.state.lock().await;
        state.get(locator).cloned()
    }

    /// List all credential locators.
    pub async fn locators(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.keys().cloned().collect()
    }

    /// Add or replace a credential and persist to disk.
    pub async fn put(&self, locator: String, record: CredentialRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.insert(locator.clone(), record);
        debug!(locator, "stored credential");
        write_atomic(&self.path, &state).await
    }

    /// Remove a credential and persist to disk.
    ///
    /// Returns the removed record if it existed.
    pub async fn remove(&self, locator: &str) -> Result<Option<CredentialRecord>> {
        let mut state = self.state.lock().await;
        let removed = state.remove(locator);
        if removed.is_some() {
            debug!(locator, "removed credential");
            write_atomic(&self.path, &state).await?;
        }
        Ok(removed)
    }

    /// Number of stored credentials.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resolve the upstream auth value for a credential, refreshing
    /// OAuth tokens that fall within the skew of expiry.
    ///
    /// On refresh failure the cached record is left unchanged and the
    /// error surfaces to the caller.
    pub async fn bearer_value(&self, locator: &str) -> Result<AuthValue> {
        let record = self
            .get(locator)
            .await
            .ok_or_else(|| Error::NotFound(format!("no credential for locator {locator}")))?;

        match record.kind {
            CredentialKind::StaticKey => {
                let key = record.key.ok_or_else(|| {
                    Error::CredentialParse(format!("static_key record {locator} missing key"))
                })?;
                Ok(AuthValue::ApiKey(key))
            }
            CredentialKind::Oauth => {
                let oauth = record.oauth.ok_or_else(|| {
                    Error::CredentialParse(format!("oauth record {locator} missing token pair"))
                })?;
                if !self.is_stale(&oauth) {
                    return Ok(AuthValue::Bearer(oauth.access_token));
                }
                let access = self.refresh_single_flight(locator).await?;
                Ok(AuthValue::Bearer(access))
            }
        }
    }

    /// Refresh an OAuth credential if it is still stale, serialized per
    /// locator.
    ///
    /// Concurrent callers for the same locator queue on the per-locator
    /// mutex; whoever wins performs the exchange, and the losers observe
    /// the updated record on the re-check and return without a second
    /// exchange. This avoids refresh-token invalidation races at the
    /// token endpoint.
    pub async fn refresh_single_flight(&self, locator: &str) -> Result<String> {
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks
                .entry(locator.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Re-check under the lock: a concurrent caller may have already
        // refreshed while we waited.
        let oauth = {
            let state = self.state.lock().await;
            let record = state
                .get(locator)
                .ok_or_else(|| Error::NotFound(format!("no credential for locator {locator}")))?;
            record
                .oauth
                .clone()
                .ok_or_else(|| Error::CredentialParse(format!("{locator} is not an oauth record")))?
        };
        if !self.is_stale(&oauth) {
            return Ok(oauth.access_token);
        }

        debug!(
            locator,
            credential = %mask_credential(&oauth.access_token),
            "refreshing expiring token"
        );

        let response =
            match token::refresh_token(&self.http, &self.token_endpoint, &oauth.refresh_token)
                .await
            {
                Ok(response) => response,
                Err(Error::InvalidCredentials(msg)) => {
                    warn!(locator, "refresh token rejected by server");
                    return Err(Error::InvalidCredentials(msg));
                }
                Err(e) => return Err(Error::RefreshFailed(e.to_string())),
            };

        let scopes = if response.scope.is_some() {
            response.scopes()
        } else {
            oauth.scopes.clone()
        };
        let updated = OAuthTokens {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token,
            expires_at_epoch_ms: now_ms() + response.expires_in * 1000,
            scopes,
            is_max: oauth.is_max,
        };

        let mut state = self.state.lock().await;
        if let Some(record) = state.get_mut(locator) {
            record.oauth = Some(updated);
        }
        write_atomic(&self.path, &state).await?;
        info!(locator, "refreshed oauth credential");

        Ok(response.access_token)
    }

    /// Locators of OAuth records whose expiry falls within the skew.
    pub async fn stale_oauth_locators(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .iter()
            .filter(|(_, record)| {
                record.kind == CredentialKind::Oauth
                    && record.oauth.as_ref().is_some_and(|o| self.is_stale(o))
            })
            .map(|(locator, _)| locator.clone())
            .collect()
    }

    fn is_stale(&self, oauth: &OAuthTokens) -> bool {
        now_ms() + self.refresh_skew_ms >= oauth.expires_at_epoch_ms
    }
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Write the credential map to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it
/// over the target. This prevents corruption if the process crashes
/// mid-write. Sets file permissions to 0600 (owner read/write only)
/// since the file contains key material.
async fn write_atomic(path: &Path, data: &HashMap<String, CredentialRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    // Set 0600 permissions (unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
