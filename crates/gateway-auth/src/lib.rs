//! Credential management for the Messages gateway
//!
//! Provides per-domain credential records (static API keys and OAuth
//! token pairs), a JSON credential file store with atomic persistence,
//! PKCE flow generation, token exchange/refresh, and the operator login
//! flow. This crate is a standalone library with no dependency on the
//! gateway binary.
//!
//! OAuth credential lifecycle:
//! 1. Operator runs `login::begin()` and opens the authorization URL
//! 2. The loopback callback listener receives `code` + `state`
//! 3. `token::exchange_code()` trades the code for a token pair
//! 4. The record is persisted via `CredentialStore::put()`
//! 5. Request-time: `CredentialStore::bearer_value()` refreshes the
//!    token single-flight when it is within the skew of expiry
//! 6. A background task refreshes proactively (`spawn_refresh_task`)

pub mod constants;
pub mod credentials;
pub mod error;
pub mod login;
pub mod pkce;
pub mod refresh;
pub mod token;

pub use constants::*;
pub use credentials::{AuthValue, CredentialKind, CredentialRecord, CredentialStore, OAuthTokens};
pub use error::{Error, Result};
pub use login::LoginFlow;
pub use pkce::{build_authorization_url, compute_challenge, generate_state, generate_verifier};
pub use refresh::spawn_refresh_task;
pub use token::{TokenResponse, exchange_code, refresh_token};
