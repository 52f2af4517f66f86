//! Background maintenance loop.
//!
//! Sweeps expired entries out of the resource cache while the server runs.
//! Reads already treat expired entries as absent; the sweep only bounds
//! memory held by URLs that are never requested again.

use crate::renderer::FilterDecision;
use crate::resources::ResourceCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Interval between cache sweeps.
pub const DEFAULT_TICK: Duration = Duration::from_secs(600);

/// Spawn the maintenance loop; it stops when `shutdown` is notified.
pub fn spawn(
    cache: Arc<ResourceCache<FilterDecision>>,
    tick_every: Duration,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("maintenance loop started: tick={}s", tick_every.as_secs());
        let mut ticker = tokio::time::interval(tick_every);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::debug!("maintenance loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = cache.purge_expired();
                    if removed > 0 {
                        tracing::debug!(
                            "maintenance removed {removed} expired cache entr{}, {} left",
                            if removed == 1 { "y" } else { "ies" },
                            cache.len()
                        );
                    }
                }
            }
        }
    })
}
