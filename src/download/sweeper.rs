//! Background maintenance for the registry.
//!
//! Two duties on a fixed cadence: demote `available` records whose file has
//! left the ingest directory (an external library manager consumes it), and
//! evict terminal records past the retention timeout. Filesystem checks run
//! outside the registry lock.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::registry::Registry;

/// How often the sweeper wakes up.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Runs the sweeper until the stop token fires.
pub async fn run(registry: Arc<Registry>, interval: Duration, stop: CancellationToken) {
    tracing::info!("sweeper started, interval {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    // the immediate first tick would sweep an empty registry
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => sweep(&registry).await,
        }
    }
    tracing::info!("sweeper stopped");
}

/// One maintenance pass.
pub async fn sweep(registry: &Registry) {
    for (id, path) in registry.available_paths() {
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::info!("file for {} vanished from {}, marking done", id, path);
            registry.mark_file_missing(&id);
        }
    }

    let evicted = registry.evict_stale();
    if evicted > 0 {
        tracing::info!("evicted {} stale records", evicted);
    }
}
