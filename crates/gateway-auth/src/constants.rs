//! OAuth client constants
//!
//! Public OAuth client configuration for the upstream Messages API.
//! These values are not secrets — they identify the public client
//! application. The actual secrets (access/refresh tokens, static
//! keys) live in the credential store.

/// Public OAuth client ID used for the authorization-code flow.
pub const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Token endpoint for code exchange and token refresh.
pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Authorization endpoint the operator is directed to during login.
pub const AUTHORIZE_ENDPOINT: &str = "https://claude.ai/oauth/authorize";

/// OAuth scopes requested during login.
pub const SCOPES: &str = "user:profile user:inference";

/// Beta-feature marker injected alongside OAuth bearer tokens.
pub const OAUTH_BETA_HEADER: &str = "oauth-2025-04-20";

/// Pinned API version header for the upstream messages endpoint.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
