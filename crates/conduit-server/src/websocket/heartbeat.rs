//! Periodic stale-connection sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::ConnectionRegistry;

/// Run [`ConnectionRegistry::sweep`] every `interval` until cancelled.
///
/// A connection silent for longer than `timeout`, or older than its role's
/// session timeout, is removed through the normal disconnect path. Returns
/// how many connections the loop removed.
pub async fn run_sweep(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> usize {
    let mut ticker = time::interval(interval);
    // Skip the immediate first tick
    let _ = ticker.tick().await;
    let mut removed = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let swept = registry.sweep(timeout).await;
                if !swept.is_empty() {
                    debug!(count = swept.len(), "heartbeat sweep removed connections");
                }
                removed += swept.len();
            }
            () = cancel.cancelled() => return removed,
        }
    }
}
