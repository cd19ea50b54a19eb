//! View models for the sync affordances: the pending-changes indicator with
//! its "sync now" action, and the offline badge.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use crate::connectivity::NetworkStatus;
use crate::models::DrainOutcome;
use crate::service::QueueService;

pub const DEFAULT_BANNER_DURATION: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BannerKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBanner {
    pub kind: BannerKind,
    pub message: String,
    pub processed: usize,
    pub failed: usize,
}

impl SyncBanner {
    fn from_drain(outcome: DrainOutcome, remaining: usize) -> Self {
        let (kind, message) = if outcome.failed > 0 {
            (
                BannerKind::Error,
                format!("{} change(s) could not be synced and were discarded", outcome.failed),
            )
        } else if remaining > 0 {
            (
                BannerKind::Error,
                format!("{remaining} change(s) still pending; will retry"),
            )
        } else {
            (
                BannerKind::Success,
                format!("{} change(s) synced", outcome.processed),
            )
        };
        Self {
            kind,
            message,
            processed: outcome.processed,
            failed: outcome.failed,
        }
    }
}

/// What the indicator should render right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorView {
    pub visible: bool,
    pub pending: usize,
    pub show_sync_button: bool,
    pub syncing: bool,
    pub banner: Option<SyncBanner>,
}

/// Snapshot for logs and host UIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusReport {
    pub is_online: bool,
    pub pending_items: usize,
    pub sync_in_progress: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_outcome: Option<DrainOutcome>,
}

#[derive(Default)]
struct IndicatorState {
    syncing: bool,
    banner: Option<(SyncBanner, Instant)>,
    last_outcome: Option<DrainOutcome>,
}

pub struct SyncIndicator {
    service: Arc<dyn QueueService>,
    network: watch::Receiver<NetworkStatus>,
    banner_for: Duration,
    state: Mutex<IndicatorState>,
}

impl SyncIndicator {
    pub fn new(
        service: Arc<dyn QueueService>,
        network: watch::Receiver<NetworkStatus>,
        banner_for: Duration,
    ) -> Self {
        Self {
            service,
            network,
            banner_for,
            state: Mutex::new(IndicatorState::default()),
        }
    }

    fn is_online(&self) -> bool {
        self.network.borrow().is_online()
    }

    pub fn view(&self) -> IndicatorView {
        let pending = self.service.pending_count();
        let (syncing, banner) = match self.state.lock() {
            Ok(state) => (
                state.syncing,
                state
                    .banner
                    .as_ref()
                    .filter(|(_, shown)| shown.elapsed() < self.banner_for)
                    .map(|(banner, _)| banner.clone()),
            ),
            Err(_) => (false, None),
        };
        IndicatorView {
            visible: pending > 0,
            pending,
            show_sync_button: pending > 0 && self.is_online(),
            syncing,
            banner,
        }
    }

    /// The "sync now" action. Returns the banner it raised, or `None` when
    /// offline or when a sync from this indicator is already running.
    pub async fn sync_now(&self) -> Option<SyncBanner> {
        if !self.is_online() {
            return None;
        }
        {
            let mut state = self.state.lock().ok()?;
            if state.syncing {
                return None;
            }
            state.syncing = true;
        }

        let outcome = self.service.drain().await;
        let banner = SyncBanner::from_drain(outcome, self.service.pending_count());
        debug!(kind = ?banner.kind, message = %banner.message, "manual sync finished");

        if let Ok(mut state) = self.state.lock() {
            state.syncing = false;
            state.banner = Some((banner.clone(), Instant::now()));
            state.last_outcome = Some(outcome);
        }
        Some(banner)
    }

    pub fn report(&self) -> SyncStatusReport {
        let (syncing, last_outcome) = self
            .state
            .lock()
            .map(|s| (s.syncing, s.last_outcome))
            .unwrap_or((false, None));
        SyncStatusReport {
            is_online: self.is_online(),
            pending_items: self.service.pending_count(),
            sync_in_progress: syncing || self.service.is_draining(),
            last_sync: self.service.last_sync(),
            last_outcome,
        }
    }
}

/// Offline badge; visible only while offline.
pub struct ConnectivityBadge {
    network: watch::Receiver<NetworkStatus>,
}

impl ConnectivityBadge {
    pub fn new(network: watch::Receiver<NetworkStatus>) -> Self {
        Self { network }
    }

    pub fn visible(&self) -> bool {
        *self.network.borrow() == NetworkStatus::Offline
    }

    pub fn label(&self) -> Option<&'static str> {
        self.visible().then_some("Sin conexión")
    }
}
