//! Download worker pool.
//!
//! A fixed number of long-running tasks pull from the registry, drive one
//! fetch each and write the terminal status back. Workers poll on a bounded
//! idle sleep instead of a wakeup channel; the heap stays the single source
//! of dispatch order.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::fetcher::{FetchError, Fetcher};
use super::models::QueueStatus;
use super::registry::Registry;
use crate::config::Config;

pub struct WorkerPool {
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `MAX_CONCURRENT_DOWNLOADS` workers against the registry.
    pub fn start(config: Arc<Config>, registry: Arc<Registry>) -> Self {
        let stop = CancellationToken::new();
        let fetcher = Arc::new(Fetcher::new(config.clone()));
        let idle = Duration::from_secs(config.main_loop_sleep_time);

        tracing::info!(
            "starting download worker pool with {} workers",
            config.max_concurrent_downloads
        );

        let handles = (1..=config.max_concurrent_downloads)
            .map(|worker_id| {
                let registry = registry.clone();
                let fetcher = fetcher.clone();
                let stop = stop.clone();
                tokio::spawn(worker_loop(worker_id, registry, fetcher, stop, idle))
            })
            .collect();

        Self { stop, handles }
    }

    /// Signals every worker to stop and waits for them to quiesce. Workers
    /// finish their current item first; in-flight downloads are not
    /// force-cancelled here.
    pub async fn shutdown(self) {
        tracing::info!("stopping download worker pool");
        self.stop.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("download worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    registry: Arc<Registry>,
    fetcher: Arc<Fetcher>,
    stop: CancellationToken,
    idle: Duration,
) {
    tracing::info!("worker {} started", worker_id);
    loop {
        if stop.is_cancelled() {
            break;
        }

        let Some((book_id, cancel)) = registry.get_next() else {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(idle) => continue,
            }
        };

        tracing::info!("worker {} picked up {}", worker_id, book_id);
        process_download(&registry, &fetcher, &book_id, &cancel).await;
    }
    tracing::info!("worker {} stopping", worker_id);
}

/// Drives one download and records its terminal outcome.
async fn process_download(
    registry: &Registry,
    fetcher: &Fetcher,
    book_id: &str,
    cancel: &CancellationToken,
) {
    let Some(book) = registry.book(book_id) else {
        tracing::error!("book {} dispatched but no longer tracked", book_id);
        registry.update_status(book_id, QueueStatus::Error);
        return;
    };

    match fetcher
        .download_book(&book, cancel, |pct| registry.update_progress(book_id, pct))
        .await
    {
        Ok(path) => {
            registry.update_path(book_id, &path);
            registry.update_status(book_id, QueueStatus::Available);
            tracing::info!("download of {} complete: {}", book_id, path.display());
        }
        Err(FetchError::Cancelled) => {
            registry.update_status(book_id, QueueStatus::Cancelled);
            tracing::info!("download of {} cancelled", book_id);
        }
        Err(err) => {
            registry.update_status(book_id, QueueStatus::Error);
            tracing::error!("download of {} failed: {}", book_id, err);
        }
    }
}
