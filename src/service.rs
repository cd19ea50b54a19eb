//! Injected queue façade.
//!
//! Pages, the connectivity monitor and the status affordances all talk to the
//! sync engine through `Arc<dyn QueueService>`; `OfflineSync` is the real
//! implementation composed from the queue and the replay engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::connectivity::NetworkStatus;
use crate::db::{PartitionSpec, APP_PARTITIONS};
use crate::models::{DrainOutcome, HttpMethod, QueuedRequest};
use crate::queue::SyncQueue;
use crate::replay::ReplayEngine;
use crate::transport::{is_success_status, status_error};

#[async_trait]
pub trait QueueService: Send + Sync {
    async fn enqueue(&self, endpoint: &str, method: HttpMethod, data: Option<Value>) -> bool;
    async fn list_pending(&self) -> Vec<QueuedRequest>;
    async fn drain(&self) -> DrainOutcome;
    /// Display counter value (may lag the queue until the next drain).
    fn pending_count(&self) -> usize;
    fn subscribe_pending(&self) -> watch::Receiver<usize>;
    fn is_draining(&self) -> bool;
    fn last_sync(&self) -> Option<DateTime<Utc>>;
}

/// Result of a page-level mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum MutationOutcome {
    /// The server accepted the request.
    Applied { status: u16 },
    /// Kept for later replay.
    Queued,
    /// Neither sent nor persisted.
    Failed,
}

pub struct OfflineSync {
    engine: ReplayEngine,
    network: watch::Receiver<NetworkStatus>,
}

impl OfflineSync {
    pub fn new(engine: ReplayEngine, network: watch::Receiver<NetworkStatus>) -> Self {
        Self { engine, network }
    }

    pub fn queue(&self) -> &SyncQueue {
        self.engine.queue()
    }

    pub fn network_status(&self) -> NetworkStatus {
        *self.network.borrow()
    }

    /// Read-side cache over one of the app's snapshot partitions.
    pub fn cache(&self, partition: PartitionSpec) -> CacheStore {
        CacheStore::new(self.queue().store().clone(), partition)
    }

    /// Try the mutation now; queue it when offline or when the call fails.
    pub async fn submit(
        &self,
        endpoint: &str,
        method: HttpMethod,
        data: Option<Value>,
    ) -> MutationOutcome {
        if self.network_status() != NetworkStatus::Offline {
            match self.engine.send_once(method, endpoint, data.as_ref()).await {
                Ok(status) if is_success_status(status) => {
                    debug!(method = %method, endpoint, status, "mutation applied");
                    return MutationOutcome::Applied { status };
                }
                Ok(status) => {
                    info!(method = %method, endpoint, reason = %status_error(status), "mutation failed; queueing");
                }
                Err(e) => {
                    info!(method = %method, endpoint, error = %e, "mutation not sent; queueing");
                }
            }
        }

        if self.queue().enqueue(endpoint, method, data).await {
            MutationOutcome::Queued
        } else {
            warn!(method = %method, endpoint, "mutation lost: could not be sent or queued");
            MutationOutcome::Failed
        }
    }

    /// Logout: wipe every partition and zero the counter.
    pub async fn reset(&self) -> bool {
        let names: Vec<&str> = APP_PARTITIONS.iter().map(|p| p.name).collect();
        let cleared = self.queue().store().clear(&names).await;
        if cleared {
            self.queue().counter().set(0);
            info!("offline data cleared");
        }
        cleared
    }

    /// Recompute the counter from the queue without replaying anything.
    pub async fn refresh_pending_count(&self) -> usize {
        let count = self.queue().len().await;
        self.queue().counter().set(count);
        count
    }
}

#[async_trait]
impl QueueService for OfflineSync {
    async fn enqueue(&self, endpoint: &str, method: HttpMethod, data: Option<Value>) -> bool {
        self.queue().enqueue(endpoint, method, data).await
    }

    async fn list_pending(&self) -> Vec<QueuedRequest> {
        self.queue().list_pending().await
    }

    async fn drain(&self) -> DrainOutcome {
        self.engine.drain().await
    }

    fn pending_count(&self) -> usize {
        self.queue().counter().get()
    }

    fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.queue().counter().subscribe()
    }

    fn is_draining(&self) -> bool {
        self.engine.is_draining()
    }

    fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.engine.last_drain_at()
    }
}
