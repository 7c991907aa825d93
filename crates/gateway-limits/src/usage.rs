//! Per-domain usage accounting
//!
//! Monotonic token and request counters keyed by hostname. `record` is
//! called from the request path after metering and must never block on
//! I/O or fail — it takes a plain std Mutex for a few counter
//! increments. A background task renders the running totals as a
//! sorted table at a fixed interval.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

/// Running totals for one domain. Reset only by explicit operator
/// action.
#[derive(Debug, Clone, Default)]
pub struct DomainUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub request_count: u64,
    pub last_updated_epoch_ms: u64,
}

/// Accumulator over all domains.
#[derive(Default)]
pub struct UsageTracker {
    domains: Mutex<HashMap<String, DomainUsage>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one completed request's token counts to a domain's totals.
    pub fn record(&self, domain: &str, input_tokens: u64, output_tokens: u64) {
        let mut domains = lock(&self.domains);
        let usage = domains.entry(domain.to_string()).or_default();
        usage.input_tokens += input_tokens;
        usage.output_tokens += output_tokens;
        usage.request_count += 1;
        usage.last_updated_epoch_ms = now_ms();
    }

    /// Sorted-by-domain snapshot of all totals.
    pub fn snapshot(&self) -> BTreeMap<String, DomainUsage> {
        lock(&self.domains)
            .iter()
            .map(|(domain, usage)| (domain.clone(), usage.clone()))
            .collect()
    }

    /// Snapshot as JSON for the statistics endpoint.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let domains: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .into_iter()
            .map(|(domain, usage)| {
                (
                    domain,
                    serde_json::json!({
                        "input_tokens": usage.input_tokens,
                        "output_tokens": usage.output_tokens,
                        "request_count": usage.request_count,
                        "last_updated_epoch_ms": usage.last_updated_epoch_ms,
                    }),
                )
            })
            .collect();
        serde_json::Value::Object(domains)
    }

    /// Clear all counters (operator action).
    pub fn reset(&self) {
        lock(&self.domains).clear();
        info!("usage counters reset");
    }

    /// Render the running totals as an aligned table, sorted by domain.
    pub fn render_table(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::from(
            "domain                           requests       input      output\n",
        );
        for (domain, usage) in &snapshot {
            out.push_str(&format!(
                "{:<32} {:>8} {:>11} {:>11}\n",
                domain, usage.request_count, usage.input_tokens, usage.output_tokens
            ));
        }
        out
    }
}

/// Spawn the periodic usage report. Abort the handle on shutdown.
pub fn spawn_report_task(
    tracker: Arc<UsageTracker>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = tracker.snapshot();
            if snapshot.is_empty() {
                continue;
            }
            info!(domains = snapshot.len(), "usage report\n{}", tracker.render_table());
        }
    })
}

/// A poisoned accumulator lock would only mean a panic mid-increment;
/// the counters are still usable, so recover the guard.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_monotonically() {
        let tracker = UsageTracker::new();
        tracker.record("a.example.com", 100, 50);
        tracker.record("a.example.com", 10, 5);

        let snapshot = tracker.snapshot();
        let usage = &snapshot["a.example.com"];
        assert_eq!(usage.input_tokens, 110);
        assert_eq!(usage.output_tokens, 55);
        assert_eq!(usage.request_count, 2);
        assert!(usage.last_updated_epoch_ms > 0);
    }

    #[test]
    fn snapshot_is_sorted_by_domain() {
        let tracker = UsageTracker::new();
        tracker.record("zeta.example.com", 1, 1);
        tracker.record("alpha.example.com", 1, 1);
        tracker.record("mid.example.com", 1, 1);

        let domains: Vec<_> = tracker.snapshot().into_keys().collect();
        assert_eq!(
            domains,
            vec!["alpha.example.com", "mid.example.com", "zeta.example.com"]
        );
    }

    #[test]
    fn reset_clears_all_domains() {
        let tracker = UsageTracker::new();
        tracker.record("a.example.com", 100, 50);
        tracker.reset();
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn render_table_lists_domains_in_order() {
        let tracker = UsageTracker::new();
        tracker.record("b.example.com", 20, 10);
        tracker.record("a.example.com", 100, 50);

        let table = tracker.render_table();
        let a_pos = table.find("a.example.com").unwrap();
        let b_pos = table.find("b.example.com").unwrap();
        assert!(a_pos < b_pos);
        assert!(table.contains("100"));
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let tracker = Arc::new(UsageTracker::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    tracker.record("shared.example.com", 1, 2);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = tracker.snapshot();
        let usage = &snapshot["shared.example.com"];
        assert_eq!(usage.request_count, 800);
        assert_eq!(usage.input_tokens, 800);
        assert_eq!(usage.output_tokens, 1600);
    }

    #[test]
    fn snapshot_json_shape() {
        let tracker = UsageTracker::new();
        tracker.record("a.example.com", 7, 3);
        let json = tracker.snapshot_json();
        assert_eq!(json["a.example.com"]["input_tokens"], 7);
        assert_eq!(json["a.example.com"]["output_tokens"], 3);
        assert_eq!(json["a.example.com"]["request_count"], 1);
    }
}
