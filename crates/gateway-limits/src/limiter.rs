//! Sliding-window rate limiter
//!
//! Each key (masked credential prefix or hostname) owns an entry with a
//! request counter, a token counter, and the current window start. On
//! the first request of a new window the entry resets. Exceeding the
//! request ceiling blocks the key until the window ends and rejects the
//! offending request; exceeding the token ceiling (recorded after the
//! upstream call completes) blocks only subsequent requests — the
//! already-admitted request is never retroactively rejected.
//!
//! A single Mutex over the entry map linearizes admission and token
//! accounting per key, so concurrent requests against the same
//! credential cannot lose updates.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Ceilings and window size for one limiter instance.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub window: Duration,
    pub max_requests: u64,
    pub max_tokens: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 60,
            max_tokens: 200_000,
        }
    }
}

/// Admission outcome for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    Rejected { retry_after: Duration },
}

/// Per-key window state.
#[derive(Debug, Clone)]
struct Entry {
    requests_in_window: u64,
    tokens_in_window: u64,
    window_start_ms: u64,
    blocked: bool,
    block_expiry_ms: Option<u64>,
}

impl Entry {
    fn new(now_ms: u64) -> Self {
        Self {
            requests_in_window: 0,
            tokens_in_window: 0,
            window_start_ms: now_ms,
            blocked: false,
            block_expiry_ms: None,
        }
    }

    fn window_end_ms(&self, window_ms: u64) -> u64 {
        self.window_start_ms + window_ms
    }

    fn reset(&mut self, now_ms: u64) {
        *self = Entry::new(now_ms);
    }
}

/// Sliding-window limiter over an arbitrary key space.
pub struct SlidingWindowLimiter {
    config: LimiterConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject a request for `key` at the current time.
    pub async fn check(&self, key: &str) -> Decision {
        self.check_at(key, now_ms()).await
    }

    /// Admit or reject at an explicit timestamp (tests drive the clock).
    pub async fn check_at(&self, key: &str, now_ms: u64) -> Decision {
        let window_ms = self.config.window.as_millis() as u64;
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(now_ms));

        if now_ms >= entry.window_end_ms(window_ms) {
            entry.reset(now_ms);
        }

        if entry.blocked {
            match entry.block_expiry_ms {
                Some(expiry) if now_ms < expiry => {
                    let retry_after = Duration::from_millis(expiry - now_ms);
                    debug!(key, retry_after_ms = expiry - now_ms, "request rejected, key blocked");
                    return Decision::Rejected { retry_after };
                }
                _ => {
                    // Block expired inside the same window (token blocks
                    // are window-aligned, so this is the reset path above
                    // in practice)
                    entry.blocked = false;
                    entry.block_expiry_ms = None;
                }
            }
        }

        if entry.requests_in_window + 1 > self.config.max_requests {
            let expiry = entry.window_end_ms(window_ms);
            entry.blocked = true;
            entry.block_expiry_ms = Some(expiry);
            let retry_after = Duration::from_millis(expiry.saturating_sub(now_ms));
            warn!(
                key,
                max_requests = self.config.max_requests,
                "request ceiling reached, blocking until window end"
            );
            return Decision::Rejected { retry_after };
        }

        entry.requests_in_window += 1;
        Decision::Admitted
    }

    /// Record token consumption after an upstream call completes.
    ///
    /// If the window total now exceeds the token ceiling, the key is
    /// blocked for the remainder of the current window. The request
    /// that pushed it over is unaffected.
    pub async fn record_tokens(&self, key: &str, tokens: u64) {
        self.record_tokens_at(key, tokens, now_ms()).await;
    }

    /// Record token consumption at an explicit timestamp.
    pub async fn record_tokens_at(&self, key: &str, tokens: u64, now_ms: u64) {
        let window_ms = self.config.window.as_millis() as u64;
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(now_ms));

        if now_ms >= entry.window_end_ms(window_ms) {
            entry.reset(now_ms);
        }

        entry.tokens_in_window += tokens;
        if entry.tokens_in_window > self.config.max_tokens && !entry.blocked {
            entry.blocked = true;
            entry.block_expiry_ms = Some(entry.window_end_ms(window_ms));
            warn!(
                key,
                tokens_in_window = entry.tokens_in_window,
                max_tokens = self.config.max_tokens,
                "token ceiling exceeded, blocking subsequent requests this window"
            );
        }
    }

    /// Per-key window state for the operator surface.
    pub async fn snapshot(&self) -> serde_json::Value {
        let entries = self.entries.lock().await;
        let keys: serde_json::Map<String, serde_json::Value> = entries
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    serde_json::json!({
                        "requests_in_window": entry.requests_in_window,
                        "tokens_in_window": entry.tokens_in_window,
                        "window_start_epoch_ms": entry.window_start_ms,
                        "blocked": entry.blocked,
                        "block_expiry_epoch_ms": entry.block_expiry_ms,
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "window_secs": self.config.window.as_secs(),
            "max_requests": self.config.max_requests,
            "max_tokens": self.config.max_tokens,
            "keys": keys,
        })
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
