//! Connectivity state machine and drain triggers.
//!
//! Drains are triggered by an Offline→Online transition, by the initial
//! mount when online, by a `BackgroundSync` message from the worker, and by
//! the interval fallback while the counter is non-zero.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::background::BackgroundTrigger;
use crate::models::{DrainOutcome, SyncMessage};
use crate::service::QueueService;

/// Reachability check for the API.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
    Unknown,
}

impl NetworkStatus {
    pub fn is_online(self) -> bool {
        self == NetworkStatus::Online
    }
}

/// Platform connectivity notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

pub struct ConnectivityMonitor {
    service: Arc<dyn QueueService>,
    trigger: Option<Arc<dyn BackgroundTrigger>>,
    tag: String,
    status: watch::Sender<NetworkStatus>,
    worker_replies: Option<mpsc::UnboundedSender<SyncMessage>>,
}

impl ConnectivityMonitor {
    pub fn new(
        service: Arc<dyn QueueService>,
        trigger: Option<Arc<dyn BackgroundTrigger>>,
        tag: &str,
        status: watch::Sender<NetworkStatus>,
    ) -> Self {
        Self {
            service,
            trigger,
            tag: tag.to_string(),
            status,
            worker_replies: None,
        }
    }

    /// Channel on which drain results for `BackgroundSync` messages are posted.
    pub fn with_worker_replies(mut self, replies: mpsc::UnboundedSender<SyncMessage>) -> Self {
        self.worker_replies = Some(replies);
        self
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    pub async fn on_mount(&self, online: bool) -> Option<DrainOutcome> {
        if !online {
            self.status.send_replace(NetworkStatus::Offline);
            return None;
        }
        self.status.send_replace(NetworkStatus::Online);
        let outcome = self.service.drain().await;
        self.try_register().await;
        Some(outcome)
    }

    /// Apply a connectivity event. Returns the drain outcome when the event
    /// caused a drain.
    pub async fn handle_event(&self, event: ConnectivityEvent) -> Option<DrainOutcome> {
        match event {
            ConnectivityEvent::Offline => {
                if self.status.send_replace(NetworkStatus::Offline) != NetworkStatus::Offline {
                    info!("network offline; mutations will be queued");
                }
                None
            }
            ConnectivityEvent::Online => {
                if self.status.send_replace(NetworkStatus::Online) == NetworkStatus::Online {
                    return None;
                }
                info!("network online; draining sync queue");
                let outcome = self.service.drain().await;
                self.try_register().await;
                Some(outcome)
            }
        }
    }

    /// Handle a message from the background worker. Replies (also returned)
    /// go back on the worker channel.
    pub async fn handle_message(&self, message: SyncMessage) -> Option<SyncMessage> {
        let SyncMessage::BackgroundSync { tag } = message else {
            return None;
        };
        debug!(tag = %tag, "background sync requested");
        let reply = SyncMessage::from_outcome(self.service.drain().await);
        if let Some(replies) = &self.worker_replies {
            if replies.send(reply.clone()).is_err() {
                debug!("worker reply channel closed");
            }
        }
        Some(reply)
    }

    /// Fire-and-forget drain.
    pub fn spawn_drain(&self) -> JoinHandle<DrainOutcome> {
        let service = self.service.clone();
        tokio::spawn(async move { service.drain().await })
    }

    async fn try_register(&self) -> bool {
        match &self.trigger {
            Some(trigger) => trigger.try_register(&self.tag).await,
            None => false,
        }
    }

    /// Interval tick: probe, convert status changes to events, and drain
    /// while online with work pending.
    async fn tick(&self, probe: Option<&Arc<dyn NetworkProbe>>) {
        let online = match probe {
            Some(probe) => probe.is_online().await,
            None => self.status().is_online(),
        };
        let event = if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        };
        if self.handle_event(event).await.is_some() || !online {
            return;
        }
        if self.service.pending_count() > 0 && !self.service.is_draining() {
            debug!(pending = self.service.pending_count(), "interval sync");
            self.service.drain().await;
        }
    }

    /// Run the monitor until `cancel` fires.
    ///
    /// `probe` decides the mount state and drives the interval; without one
    /// the monitor starts online and relies on `events`.
    pub fn start(
        self: Arc<Self>,
        probe: Option<Arc<dyn NetworkProbe>>,
        interval: Duration,
        mut events: mpsc::UnboundedReceiver<ConnectivityEvent>,
        mut messages: mpsc::UnboundedReceiver<SyncMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Connectivity monitor started (interval: {}s)", interval.as_secs());

            let online = match &probe {
                Some(probe) => probe.is_online().await,
                None => true,
            };
            if let Some(outcome) = self.on_mount(online).await {
                debug!(processed = outcome.processed, failed = outcome.failed, "mount drain finished");
            }

            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(event) = events.recv() => {
                        self.handle_event(event).await;
                    }
                    Some(message) = messages.recv() => {
                        if let Some(SyncMessage::SyncFailed { processed, failed }) =
                            self.handle_message(message).await
                        {
                            warn!(processed, failed, "background drain dropped requests");
                        }
                    }
                    _ = ticker.tick() => {
                        self.tick(probe.as_ref()).await;
                    }
                }
            }
            info!("Connectivity monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeQueueService, StaticProbe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTrigger(AtomicUsize);

    #[async_trait]
    impl BackgroundTrigger for CountingTrigger {
        async fn try_register(&self, _tag: &str) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn monitor(
        service: Arc<FakeQueueService>,
        trigger: Option<Arc<dyn BackgroundTrigger>>,
        initial: NetworkStatus,
    ) -> ConnectivityMonitor {
        let (tx, _rx) = watch::channel(initial);
        ConnectivityMonitor::new(service, trigger, "sync-requests", tx)
    }

    #[tokio::test]
    async fn test_online_transition_drains_and_registers() {
        let service = Arc::new(FakeQueueService::with_pending(2));
        let trigger = Arc::new(CountingTrigger(AtomicUsize::new(0)));
        let m = monitor(service.clone(), Some(trigger.clone()), NetworkStatus::Offline);

        let outcome = m.handle_event(ConnectivityEvent::Online).await;
        assert_eq!(outcome, Some(DrainOutcome { processed: 2, failed: 0 }));
        assert_eq!(service.drain_calls(), 1);
        assert_eq!(trigger.0.load(Ordering::SeqCst), 1);
        assert_eq!(m.status(), NetworkStatus::Online);

        // Already online: no second drain.
        assert_eq!(m.handle_event(ConnectivityEvent::Online).await, None);
        assert_eq!(service.drain_calls(), 1);
    }

    #[tokio::test]
    async fn test_offline_transition_only_updates_status() {
        let service = Arc::new(FakeQueueService::with_pending(1));
        let m = monitor(service.clone(), None, NetworkStatus::Online);
        let mut rx = m.subscribe();

        assert_eq!(m.handle_event(ConnectivityEvent::Offline).await, None);
        assert_eq!(*rx.borrow_and_update(), NetworkStatus::Offline);
        assert_eq!(service.drain_calls(), 0);
    }

    #[tokio::test]
    async fn test_mount_drains_only_when_online() {
        let service = Arc::new(FakeQueueService::with_pending(1));
        let m = monitor(service.clone(), None, NetworkStatus::Unknown);
        assert_eq!(m.on_mount(false).await, None);
        assert_eq!(service.drain_calls(), 0);

        assert!(m.on_mount(true).await.is_some());
        assert_eq!(service.drain_calls(), 1);
    }

    #[tokio::test]
    async fn test_background_sync_message_posts_reply() {
        let service = Arc::new(FakeQueueService::with_pending(3));
        service.fail_next(1);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let m = monitor(service.clone(), None, NetworkStatus::Online).with_worker_replies(reply_tx);

        let reply = m
            .handle_message(SyncMessage::BackgroundSync {
                tag: "sync-requests".into(),
            })
            .await;
        let expected = SyncMessage::SyncFailed {
            processed: 2,
            failed: 1,
        };
        assert_eq!(reply, Some(expected.clone()));
        assert_eq!(reply_rx.recv().await, Some(expected));

        // Replies from the worker side are not drain requests.
        assert_eq!(
            m.handle_message(SyncMessage::SyncCompleted {
                processed: 0,
                failed: 0
            })
            .await,
            None
        );
        assert_eq!(service.drain_calls(), 1);
    }

    #[tokio::test]
    async fn test_spawn_drain_is_fire_and_forget() {
        let service = Arc::new(FakeQueueService::with_pending(1));
        let m = monitor(service.clone(), None, NetworkStatus::Online);
        let handle = m.spawn_drain();
        assert_eq!(handle.await.unwrap().processed, 1);
    }

    #[tokio::test]
    async fn test_start_loop_handles_events_and_cancellation() {
        let service = Arc::new(FakeQueueService::with_pending(0));
        let (status_tx, mut status_rx) = watch::channel(NetworkStatus::Unknown);
        let m = Arc::new(ConnectivityMonitor::new(service.clone(), None, "sync-requests", status_tx));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (_msg_tx, msg_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let probe: Arc<dyn NetworkProbe> = Arc::new(StaticProbe::new(false));

        let handle = m.clone().start(
            Some(probe),
            Duration::from_secs(3600),
            event_rx,
            msg_rx,
            cancel.clone(),
        );

        status_rx
            .wait_for(|s| *s == NetworkStatus::Offline)
            .await
            .unwrap();
        assert_eq!(service.drain_calls(), 0);

        service.add_pending(2);
        event_tx.send(ConnectivityEvent::Online).unwrap();
        status_rx.wait_for(|s| *s == NetworkStatus::Online).await.unwrap();
        service.wait_for_drains(1).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_interval_drains_while_online_with_pending_work() {
        let service = Arc::new(FakeQueueService::with_pending(0));
        let (status_tx, _rx) = watch::channel(NetworkStatus::Unknown);
        let m = Arc::new(ConnectivityMonitor::new(service.clone(), None, "sync-requests", status_tx));

        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let (_msg_tx, msg_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let probe = Arc::new(StaticProbe::new(true));

        let handle = m.clone().start(
            Some(probe.clone() as Arc<dyn NetworkProbe>),
            Duration::from_millis(20),
            event_rx,
            msg_rx,
            cancel.clone(),
        );

        // Mount drain on an empty queue.
        service.wait_for_drains(1).await;
        service.add_pending(1);
        service.wait_for_drains(2).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(service.pending_count(), 0);
    }
}
