//! Durable queue of mutating requests awaiting replay.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::background::BackgroundTrigger;
use crate::counter::PendingCounter;
use crate::db::SYNC_REQUESTS;
use crate::models::{HttpMethod, QueuedRequest};
use crate::store::DurableStore;

/// Default background-sync tag registered on enqueue.
pub const DEFAULT_SYNC_TAG: &str = "sync-requests";

#[derive(Clone)]
pub struct SyncQueue {
    store: DurableStore,
    counter: PendingCounter,
    trigger: Option<Arc<dyn BackgroundTrigger>>,
    tag: String,
}

impl SyncQueue {
    pub fn new(
        store: DurableStore,
        counter: PendingCounter,
        trigger: Option<Arc<dyn BackgroundTrigger>>,
        tag: &str,
    ) -> Self {
        Self {
            store,
            counter,
            trigger,
            tag: tag.to_string(),
        }
    }

    /// Persist a request for later replay.
    ///
    /// Returns whether the entry was stored. The counter bump and the
    /// background registration only follow a successful write, and a failed
    /// registration does not change the result.
    pub async fn enqueue_as<T: Serialize + Send + Sync>(
        &self,
        endpoint: &str,
        method: HttpMethod,
        data: Option<T>,
    ) -> bool {
        let request = QueuedRequest::new(endpoint, method, data);
        if !self.store.put_as(SYNC_REQUESTS.name, &request).await {
            warn!(method = %method, endpoint, "failed to queue request for sync");
            return false;
        }

        let pending = self.counter.increment();
        info!(
            id = %request.id,
            method = %method,
            endpoint,
            pending,
            "request queued for sync"
        );

        if let Some(trigger) = &self.trigger {
            if !trigger.try_register(&self.tag).await {
                debug!(tag = %self.tag, "background sync unavailable; relying on online/manual triggers");
            }
        }
        true
    }

    pub async fn enqueue(
        &self,
        endpoint: &str,
        method: HttpMethod,
        data: Option<serde_json::Value>,
    ) -> bool {
        self.enqueue_as(endpoint, method, data).await
    }

    pub async fn list_pending(&self) -> Vec<QueuedRequest> {
        self.store.get_all_as(SYNC_REQUESTS.name).await
    }

    /// Pending entries whose payload matches `T`; others are skipped.
    pub async fn list_pending_as<T: DeserializeOwned>(&self) -> Vec<QueuedRequest<T>> {
        self.store.get_all_as(SYNC_REQUESTS.name).await
    }

    /// Size of the queue partition (the source of truth for the counter).
    pub async fn len(&self) -> usize {
        self.store.count(SYNC_REQUESTS.name).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn counter(&self) -> &PendingCounter {
        &self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::LocalStorage;
    use crate::db::{self, APP_PARTITIONS};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTrigger {
        calls: AtomicUsize,
        result: bool,
    }

    #[async_trait]
    impl BackgroundTrigger for CountingTrigger {
        async fn try_register(&self, _tag: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
        }
    }

    fn test_queue(trigger: Option<Arc<dyn BackgroundTrigger>>) -> SyncQueue {
        let store = DurableStore::new(db::init_in_memory(APP_PARTITIONS).unwrap());
        let counter = PendingCounter::new(Arc::new(LocalStorage::in_memory()));
        SyncQueue::new(store, counter, trigger, DEFAULT_SYNC_TAG)
    }

    #[tokio::test]
    async fn test_enqueue_persists_entry_and_bumps_counter() {
        let queue = test_queue(None);
        assert!(
            queue
                .enqueue("https://api.agua.app/pagos", HttpMethod::Post, Some(json!({ "monto": 50 })))
                .await
        );

        let pending = queue.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
        assert_eq!(pending[0].method, HttpMethod::Post);
        assert_eq!(pending[0].data, Some(json!({ "monto": 50 })));
        assert_eq!(queue.counter().get(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_succeeds_when_background_registration_fails() {
        let trigger = Arc::new(CountingTrigger {
            calls: AtomicUsize::new(0),
            result: false,
        });
        let queue = test_queue(Some(trigger.clone()));

        assert!(queue.enqueue("/usuarios/7", HttpMethod::Delete, None).await);
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_persistence_does_not_touch_counter_or_trigger() {
        let trigger = Arc::new(CountingTrigger {
            calls: AtomicUsize::new(0),
            result: true,
        });
        let store = DurableStore::new(db::init_in_memory(&[]).unwrap());
        let counter = PendingCounter::new(Arc::new(LocalStorage::in_memory()));
        let queue = SyncQueue::new(store, counter, Some(trigger.clone()), DEFAULT_SYNC_TAG);

        assert!(!queue.enqueue("/pagos", HttpMethod::Post, None).await);
        assert_eq!(queue.counter().get(), 0);
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rapid_enqueues_get_distinct_ids() {
        let queue = test_queue(None);
        for i in 0..25 {
            assert!(queue.enqueue("/cargas", HttpMethod::Post, Some(json!({ "n": i }))).await);
        }
        let pending = queue.list_pending().await;
        assert_eq!(pending.len(), 25);
        assert_eq!(queue.counter().get(), 25);
    }

    #[tokio::test]
    async fn test_typed_payloads() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct NuevoPago {
            cliente_id: u32,
            monto: u32,
        }

        let queue = test_queue(None);
        let pago = NuevoPago { cliente_id: 4, monto: 50 };
        assert!(queue.enqueue_as("/pagos", HttpMethod::Post, Some(pago)).await);

        let typed = queue.list_pending_as::<NuevoPago>().await;
        assert_eq!(typed[0].data, Some(NuevoPago { cliente_id: 4, monto: 50 }));
    }
}
