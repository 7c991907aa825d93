//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The fallback key is loaded from the GATEWAY_DEFAULT_KEY env var or
//! default_key_file, never stored in the TOML directly to avoid
//! leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub credentials: CredentialsConfig,
    /// Hostname -> credential locator table. Exact match only.
    #[serde(default)]
    pub domains: HashMap<String, String>,
    /// Required when `gateway.mode = "translation"`.
    #[serde(default)]
    pub translation: Option<TranslationConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub usage: UsageConfig,
}

/// Dispatch mode: forward the native wire format unchanged, or rewrite
/// into the chat-completion protocol and back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Passthrough,
    Translation,
}

impl Mode {
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Passthrough => "passthrough",
            Mode::Translation => "translation",
        }
    }
}

/// Listener and upstream settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_listen_addr")]
    pub admin_listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credential store settings
#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    /// Path to the JSON credential file (created empty if missing).
    pub file: PathBuf,
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: u64,
    /// Interval for the proactive background refresh scan.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,
    /// Fallback static key for hostnames with no mapping.
    #[serde(skip)]
    pub default_key: Option<Secret<String>>,
    /// Path to a file containing the fallback key (alternative to
    /// GATEWAY_DEFAULT_KEY env var)
    #[serde(default)]
    pub default_key_file: Option<PathBuf>,
}

/// Translation-mode upstream and model selection
#[derive(Debug, Clone, Deserialize)]
pub struct TranslationConfig {
    pub chat_completions_url: String,
    pub reasoning_model: String,
    pub completion_model: String,
    /// Replacement for the caller's max_tokens, keyed by target model.
    #[serde(default)]
    pub max_tokens_overrides: HashMap<String, u64>,
}

impl TranslationConfig {
    pub fn translator_config(&self) -> gateway_translate::TranslationConfig {
        gateway_translate::TranslationConfig {
            reasoning_model: self.reasoning_model.clone(),
            completion_model: self.completion_model.clone(),
            max_tokens_overrides: self.max_tokens_overrides.clone(),
        }
    }
}

/// Sliding-window ceilings, shared by the credential and domain limiters
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            max_requests: default_max_requests(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl RateLimitConfig {
    pub fn limiter_config(&self) -> gateway_limits::LimiterConfig {
        gateway_limits::LimiterConfig {
            window: std::time::Duration::from_secs(self.window_secs),
            max_requests: self.max_requests,
            max_tokens: self.max_tokens,
        }
    }
}

/// Usage reporting settings
#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval(),
        }
    }
}

fn default_admin_listen_addr() -> SocketAddr {
    "127.0.0.1:9090".parse().expect("valid literal addr")
}

fn default_timeout() -> u64 {
    600
}

fn default_max_connections() -> usize {
    1000
}

fn default_refresh_skew() -> u64 {
    60
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_login_timeout() -> u64 {
    300
}

fn default_window() -> u64 {
    60
}

fn default_max_requests() -> u64 {
    60
}

fn default_max_tokens() -> u64 {
    200_000
}

fn default_report_interval() -> u64 {
    300
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Fallback key resolution order:
    /// 1. GATEWAY_DEFAULT_KEY env var
    /// 2. default_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.gateway.upstream_url.starts_with("http://")
            && !config.gateway.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.gateway.upstream_url
            )));
        }

        if config.gateway.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.rate_limit.window_secs == 0 {
            return Err(common::Error::Config(
                "rate_limit.window_secs must be greater than 0".into(),
            ));
        }

        if config.rate_limit.max_requests == 0 {
            return Err(common::Error::Config(
                "rate_limit.max_requests must be greater than 0".into(),
            ));
        }

        match (&config.gateway.mode, &config.translation) {
            (Mode::Translation, None) => {
                return Err(common::Error::Config(
                    "gateway.mode = \"translation\" requires a [translation] section".into(),
                ));
            }
            (_, Some(t)) => {
                if !t.chat_completions_url.starts_with("http://")
                    && !t.chat_completions_url.starts_with("https://")
                {
                    return Err(common::Error::Config(format!(
                        "chat_completions_url must start with http:// or https://, got: {}",
                        t.chat_completions_url
                    )));
                }
            }
            _ => {}
        }

        // Resolve fallback key: env var takes precedence over file
        if let Ok(key) = std::env::var("GATEWAY_DEFAULT_KEY") {
            config.credentials.default_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.credentials.default_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read default_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.credentials.default_key = Some(Secret::new(key));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("messages-gateway.toml")
    }
}
