//! Rate limiting and usage accounting for the Messages gateway
//!
//! Two sliding-window limiters run per request: one keyed by credential
//! identity, one by hostname. Each key tracks requests and token
//! consumption within the current window; exceeding either ceiling
//! blocks the key until the window ends. The usage tracker accumulates
//! per-domain token totals for periodic reporting.
//!
//! All state is process-local and lost on restart by design.

pub mod limiter;
pub mod usage;

pub use limiter::{Decision, LimiterConfig, SlidingWindowLimiter};
pub use usage::{DomainUsage, UsageTracker, spawn_report_task};
