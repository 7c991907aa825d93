//! Proactive background token refresh
//!
//! Spawns a periodic task that scans the credential store and refreshes
//! OAuth tokens approaching expiration. This prevents most request-time
//! refresh latency. The task shares the store's per-locator refresh
//! locks, so it never races a request-time refresh for the same
//! credential.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::error::Error;

/// Spawn a background task that refreshes expiring OAuth credentials.
///
/// Runs every `interval` and refreshes any token within the store's
/// configured skew of expiry. On 401/403 from the token endpoint the
/// credential is left in place but logged; transient errors are retried
/// on the next cycle.
///
/// Returns a `JoinHandle` for the spawned task; abort it on shutdown.
pub fn spawn_refresh_task(
    store: Arc<CredentialStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick — credentials were just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&store).await;
        }
    })
}

/// Run one refresh cycle over every stale OAuth credential.
async fn refresh_cycle(store: &CredentialStore) {
    let stale = store.stale_oauth_locators().await;
    if stale.is_empty() {
        debug!("no credentials within refresh skew");
        return;
    }

    for locator in stale {
        match store.refresh_single_flight(&locator).await {
            Ok(_) => info!(locator, "background token refresh succeeded"),
            Err(Error::InvalidCredentials(msg)) => {
                warn!(locator, error = %msg, "refresh token rejected, operator must re-authorize");
            }
            Err(e) => {
                warn!(locator, error = %e, "background refresh failed (transient), will retry next cycle");
            }
        }
    }
}
