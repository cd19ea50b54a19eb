//! Water Admin offline sync engine
//!
//! Captures mutating API calls made while the device is offline (or when the
//! call fails), keeps them in a local SQLite store, and replays them once the
//! API is reachable again. Drains are triggered by connectivity changes, by
//! the in-process background worker, by an interval fallback, and by the
//! "sync now" action of the pending-changes indicator.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod background;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod counter;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod queue;
pub mod replay;
pub mod service;
pub mod status;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::SyncConfig;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, NetworkStatus};
pub use error::{SyncError, SyncResult};
pub use models::{DrainOutcome, HttpMethod, QueuedRequest, SyncMessage};
pub use queue::SyncQueue;
pub use replay::{ReplayEngine, RetryPolicy};
pub use service::{MutationOutcome, OfflineSync, QueueService};
pub use status::{ConnectivityBadge, SyncIndicator, SyncStatusReport};
pub use store::DurableStore;

use background::{BackgroundTrigger, BackgroundWorker, GatedBackgroundSync};
use connectivity::NetworkProbe;
use counter::{LocalStorage, PendingCounter};
use credentials::KeyringTokenSource;
use transport::{HealthProbe, HttpTransport};

/// Wire the engine from `config` and run the monitor until Ctrl-C.
pub async fn run(config: SyncConfig) -> anyhow::Result<()> {
    info!(
        "Starting water-admin-offline v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA")
    );
    info!(
        data_dir = %config.data_dir.display(),
        api = %config.api_base_url,
        policy = ?config.retry_policy,
        "sync configuration loaded"
    );

    let store = DurableStore::new(db::init(&config.data_dir, db::APP_PARTITIONS)?);
    let counter = PendingCounter::new(Arc::new(LocalStorage::open(&config.local_storage_path())));
    let cancel = CancellationToken::new();
    let interval = config.monitor_interval();

    let probe: Arc<dyn NetworkProbe> =
        Arc::new(HealthProbe::new(&config.api_base_url, &config.health_path)?);

    // Worker -> page (BACKGROUND_SYNC) and page -> worker (SYNC_COMPLETED/FAILED).
    let (page_tx, page_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    let mut worker_handle = None;
    let trigger: Option<Arc<dyn BackgroundTrigger>> = if config.background_sync {
        let worker = Arc::new(BackgroundWorker::new(page_tx, true));
        worker_handle = Some(worker.clone().spawn(
            probe.clone(),
            interval,
            reply_rx,
            cancel.clone(),
        ));
        Some(Arc::new(GatedBackgroundSync::new(worker, &config.api_base_url)))
    } else {
        None
    };

    let queue = SyncQueue::new(store, counter, trigger.clone(), &config.sync_tag);
    let transport = Arc::new(HttpTransport::new(
        Some(&config.api_base_url),
        config.request_timeout(),
    )?);
    let engine = ReplayEngine::new(
        queue,
        transport,
        Arc::new(KeyringTokenSource::default()),
        config.retry_policy,
        config.max_attempts,
    );

    let (network_tx, network_rx) = watch::channel(NetworkStatus::Unknown);
    let sync = Arc::new(OfflineSync::new(engine, network_rx.clone()));
    let pending = sync.refresh_pending_count().await;
    info!(pending, "pending sync queue loaded");

    let monitor = Arc::new(
        ConnectivityMonitor::new(sync.clone(), trigger, &config.sync_tag, network_tx)
            .with_worker_replies(reply_tx),
    );
    let indicator = SyncIndicator::new(sync.clone(), network_rx.clone(), config.banner_duration());
    let badge = ConnectivityBadge::new(network_rx);

    // Platform connectivity events; the health probe drives state in the agent.
    let (_event_tx, event_rx) = mpsc::unbounded_channel::<ConnectivityEvent>();
    let mut status_rx = monitor.subscribe();
    let monitor_handle = monitor.start(Some(probe), interval, event_rx, page_rx, cancel.clone());

    let status_cancel = cancel.clone();
    let mut pending_rx = sync.subscribe_pending();
    let status_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = status_cancel.cancelled() => break,
                changed = pending_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(label) = badge.label() {
                        warn!(badge = label, "API unreachable");
                    }
                }
            }
            match serde_json::to_string(&indicator.report()) {
                Ok(report) => info!(status = %report, "sync status"),
                Err(e) => warn!(error = %e, "failed to serialize sync status"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();

    monitor_handle.await?;
    status_handle.await?;
    if let Some(handle) = worker_handle {
        handle.await?;
    }
    info!(pending = sync.pending_count(), "water-admin-offline stopped");
    Ok(())
}
