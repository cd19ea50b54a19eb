//! Optional background-sync facility.
//!
//! Registration is best-effort: it only happens when the worker facility is
//! active, the API is served from a secure context, and the facility grants
//! the capability when probed. Every failure is logged and reported as
//! `false`; the online-event and manual triggers stay authoritative.

use async_trait::async_trait;
use reqwest::Url;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::NetworkProbe;
use crate::models::SyncMessage;

/// What the queue and connectivity layer see: one call, never fails.
#[async_trait]
pub trait BackgroundTrigger: Send + Sync {
    async fn try_register(&self, tag: &str) -> bool;
}

/// The platform facility behind a `BackgroundTrigger`.
#[async_trait]
pub trait SyncRegistrar: Send + Sync {
    fn is_active(&self) -> bool;
    /// Readiness probe; `Ok(true)` only when the capability is granted.
    async fn ready(&self) -> Result<bool, String>;
    async fn register(&self, tag: &str) -> Result<(), String>;
}

/// `https`, or plain http on a loopback host.
pub fn is_secure_context(base_url: &str) -> bool {
    let Ok(url) = Url::parse(base_url) else {
        return false;
    };
    match url.scheme() {
        "https" => true,
        "http" => match url.host_str() {
            Some("localhost") => true,
            Some(host) => host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false),
            None => false,
        },
        _ => false,
    }
}

/// Applies the three capability checks before delegating to the registrar.
pub struct GatedBackgroundSync {
    registrar: Arc<dyn SyncRegistrar>,
    secure_context: bool,
}

impl GatedBackgroundSync {
    pub fn new(registrar: Arc<dyn SyncRegistrar>, api_base_url: &str) -> Self {
        Self {
            registrar,
            secure_context: is_secure_context(api_base_url),
        }
    }
}

#[async_trait]
impl BackgroundTrigger for GatedBackgroundSync {
    async fn try_register(&self, tag: &str) -> bool {
        if !self.registrar.is_active() {
            debug!(tag, "background sync skipped: worker facility not active");
            return false;
        }
        if !self.secure_context {
            debug!(tag, "background sync skipped: insecure context");
            return false;
        }
        match self.registrar.ready().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(tag, "background sync skipped: capability not granted");
                return false;
            }
            Err(e) => {
                warn!(tag, error = %e, "background sync readiness probe failed");
                return false;
            }
        }
        match self.registrar.register(tag).await {
            Ok(()) => {
                debug!(tag, "background sync registered");
                true
            }
            Err(e) => {
                warn!(tag, error = %e, "background sync registration failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process worker
// ---------------------------------------------------------------------------

/// In-process stand-in for a service worker's sync manager.
///
/// Holds registered tags and, once it observes connectivity, posts one
/// `BackgroundSync { tag }` message per tag to the page channel.
pub struct BackgroundWorker {
    active: AtomicBool,
    granted: bool,
    tags: Mutex<BTreeSet<String>>,
    page: mpsc::UnboundedSender<SyncMessage>,
}

impl BackgroundWorker {
    pub fn new(page: mpsc::UnboundedSender<SyncMessage>, granted: bool) -> Self {
        Self {
            active: AtomicBool::new(true),
            granted,
            tags: Mutex::new(BTreeSet::new()),
            page,
        }
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn registered_tags(&self) -> Vec<String> {
        self.tags
            .lock()
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver every registered tag to the page and forget it.
    pub fn fire(&self) -> usize {
        let tags: Vec<String> = match self.tags.lock() {
            Ok(mut tags) => std::mem::take(&mut *tags).into_iter().collect(),
            Err(_) => return 0,
        };
        let mut delivered = 0;
        for tag in tags {
            if self
                .page
                .send(SyncMessage::BackgroundSync { tag: tag.clone() })
                .is_ok()
            {
                delivered += 1;
            } else {
                warn!(tag = %tag, "page channel closed; dropping background sync");
            }
        }
        delivered
    }

    /// Poll `probe` every `interval` and fire registered tags when online.
    /// Replies from the page are logged.
    pub fn spawn(
        self: Arc<Self>,
        probe: Arc<dyn NetworkProbe>,
        interval: Duration,
        mut replies: mpsc::UnboundedReceiver<SyncMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Background sync worker started (interval: {}s)", interval.as_secs());
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if self.registered_tags().is_empty() {
                            continue;
                        }
                        if probe.is_online().await {
                            let delivered = self.fire();
                            debug!(delivered, "background sync fired");
                        }
                    }
                    Some(reply) = replies.recv() => match reply {
                        SyncMessage::SyncCompleted { processed, failed } => {
                            info!(processed, failed, "background sync completed");
                        }
                        SyncMessage::SyncFailed { processed, failed } => {
                            warn!(processed, failed, "background sync finished with failures");
                        }
                        SyncMessage::BackgroundSync { .. } => {}
                    },
                }
            }
            self.deactivate();
            info!("Background sync worker stopped");
        })
    }
}

#[async_trait]
impl SyncRegistrar for BackgroundWorker {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn ready(&self) -> Result<bool, String> {
        Ok(self.granted)
    }

    async fn register(&self, tag: &str) -> Result<(), String> {
        let mut tags = self.tags.lock().map_err(|e| e.to_string())?;
        tags.insert(tag.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingRegistrar;

    #[async_trait]
    impl SyncRegistrar for FailingRegistrar {
        fn is_active(&self) -> bool {
            true
        }
        async fn ready(&self) -> Result<bool, String> {
            Err("SecurityError: sync not allowed".into())
        }
        async fn register(&self, _tag: &str) -> Result<(), String> {
            panic!("register must not be reached when readiness fails");
        }
    }

    fn worker(granted: bool) -> (Arc<BackgroundWorker>, mpsc::UnboundedReceiver<SyncMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(BackgroundWorker::new(tx, granted)), rx)
    }

    #[test]
    fn test_secure_context_rules() {
        assert!(is_secure_context("https://api.agua.app"));
        assert!(is_secure_context("http://localhost:8080"));
        assert!(is_secure_context("http://127.0.0.1:3000"));
        assert!(is_secure_context("http://[::1]:3000"));
        assert!(!is_secure_context("http://api.agua.app"));
        assert!(!is_secure_context("http://192.168.1.20"));
        assert!(!is_secure_context("not a url"));
    }

    #[tokio::test]
    async fn test_registration_requires_all_capabilities() {
        let (w, _rx) = worker(true);
        let gated = GatedBackgroundSync::new(w.clone(), "https://api.agua.app");
        assert!(gated.try_register("sync-requests").await);
        assert_eq!(w.registered_tags(), vec!["sync-requests".to_string()]);

        let (w, _rx) = worker(true);
        let insecure = GatedBackgroundSync::new(w.clone(), "http://api.agua.app");
        assert!(!insecure.try_register("sync-requests").await);
        assert!(w.registered_tags().is_empty());

        let (w, _rx) = worker(false);
        let denied = GatedBackgroundSync::new(w.clone(), "https://api.agua.app");
        assert!(!denied.try_register("sync-requests").await);

        let (w, _rx) = worker(true);
        w.deactivate();
        let inactive = GatedBackgroundSync::new(w.clone(), "https://api.agua.app");
        assert!(!inactive.try_register("sync-requests").await);
    }

    #[tokio::test]
    async fn test_probe_errors_are_swallowed() {
        let gated = GatedBackgroundSync::new(Arc::new(FailingRegistrar), "https://api.agua.app");
        assert!(!gated.try_register("sync-requests").await);
    }

    #[tokio::test]
    async fn test_fire_posts_each_tag_once() {
        let (w, mut rx) = worker(true);
        w.register("sync-requests").await.unwrap();
        w.register("sync-requests").await.unwrap();

        assert_eq!(w.fire(), 1);
        assert_eq!(
            rx.recv().await,
            Some(SyncMessage::BackgroundSync {
                tag: "sync-requests".into()
            })
        );
        assert_eq!(w.fire(), 0);
    }
}
