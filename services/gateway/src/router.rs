//! Domain routing
//!
//! Maps an inbound hostname to a credential locator. Exact match only,
//! no wildcards. Unmapped hostnames fall back to the configured default
//! key when one exists; otherwise the request proceeds unauthenticated
//! and the upstream rejects it itself (passthrough-of-failure).

use std::collections::HashMap;

/// Routing outcome for one hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Mapped to a credential locator in the store.
    Credential(String),
    /// No mapping, but a fallback key is configured.
    DefaultKey,
    /// No mapping and no fallback: forward without credentials.
    Unauthenticated,
}

#[derive(Debug, Clone)]
pub struct DomainRouter {
    mappings: HashMap<String, String>,
    has_default_key: bool,
}

impl DomainRouter {
    pub fn new(mappings: HashMap<String, String>, has_default_key: bool) -> Self {
        // Hostnames are case-insensitive; normalize once at build time.
        let mappings = mappings
            .into_iter()
            .map(|(host, locator)| (host.to_ascii_lowercase(), locator))
            .collect();
        Self {
            mappings,
            has_default_key,
        }
    }

    /// Resolve a Host header value to a route. Ports are ignored.
    pub fn route(&self, hostname: &str) -> Route {
        let host = normalize(hostname);
        if let Some(locator) = self.mappings.get(&host) {
            return Route::Credential(locator.clone());
        }
        if self.has_default_key {
            return Route::DefaultKey;
        }
        Route::Unauthenticated
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Lowercase and strip any `:port` suffix from a Host header value.
fn normalize(hostname: &str) -> String {
    hostname
        .split(':')
        .next()
        .unwrap_or(hostname)
        .to_ascii_lowercase()
}
