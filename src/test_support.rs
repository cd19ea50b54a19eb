//! Fakes shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::connectivity::NetworkProbe;
use crate::error::{SyncError, SyncResult};
use crate::models::{DrainOutcome, HttpMethod, QueuedRequest};
use crate::service::QueueService;
use crate::transport::{OutboundRequest, Transport};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

async fn wait_until(mut done: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: HttpMethod,
    pub endpoint: String,
    pub body: Option<Value>,
    pub bearer: Option<String>,
}

/// Blocks responses until released.
pub struct ResponseGate(Arc<watch::Sender<bool>>);

impl ResponseGate {
    pub fn release(&self) {
        self.0.send_replace(false);
    }
}

/// `Transport` answering from per-endpoint scripts, then a default status.
pub struct ScriptedTransport {
    default_status: Mutex<u16>,
    scripts: Mutex<HashMap<String, VecDeque<u16>>>,
    network_error: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    held: Arc<watch::Sender<bool>>,
}

impl ScriptedTransport {
    pub fn new(default_status: u16) -> Self {
        let (held, _) = watch::channel(false);
        Self {
            default_status: Mutex::new(default_status),
            scripts: Mutex::new(HashMap::new()),
            network_error: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            held: Arc::new(held),
        }
    }

    pub fn set_default_status(&self, status: u16) {
        *self.default_status.lock().unwrap() = status;
    }

    /// Statuses returned, in order, for `endpoint` before the default applies.
    pub fn script(&self, endpoint: &str, statuses: &[u16]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), statuses.iter().copied().collect());
    }

    pub fn fail_with_network_error(&self, fail: bool) {
        self.network_error.store(fail, Ordering::SeqCst);
    }

    pub fn hold_responses(&self) -> ResponseGate {
        self.held.send_replace(true);
        ResponseGate(self.held.clone())
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, n: usize) {
        wait_until(|| self.calls.lock().unwrap().len() >= n, "transport calls").await;
    }

    fn next_status(&self, endpoint: &str) -> u16 {
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| *self.default_status.lock().unwrap())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: OutboundRequest<'_>) -> SyncResult<u16> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method,
            endpoint: request.endpoint.to_string(),
            body: request.body.cloned(),
            bearer: request.bearer.map(str::to_string),
        });

        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;
        tokio::task::yield_now().await;

        let result = if self.network_error.load(Ordering::SeqCst) {
            Err(SyncError::Transport(format!(
                "Cannot reach API at {}",
                request.endpoint
            )))
        } else {
            Ok(self.next_status(request.endpoint))
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

pub struct StaticProbe(AtomicBool);

impl StaticProbe {
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }
}

#[async_trait]
impl NetworkProbe for StaticProbe {
    async fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Queue service
// ---------------------------------------------------------------------------

/// In-memory `QueueService`: a drain succeeds for every pending entry except
/// the number primed with `fail_next`.
pub struct FakeQueueService {
    pending: Arc<watch::Sender<usize>>,
    fail_next: AtomicUsize,
    drains: AtomicUsize,
    draining: AtomicBool,
    drain_delay: Mutex<Option<Duration>>,
}

impl FakeQueueService {
    pub fn with_pending(pending: usize) -> Self {
        let (tx, _) = watch::channel(pending);
        Self {
            pending: Arc::new(tx),
            fail_next: AtomicUsize::new(0),
            drains: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            drain_delay: Mutex::new(None),
        }
    }

    pub fn add_pending(&self, n: usize) {
        self.pending.send_modify(|count| *count += n);
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_drain_delay(&self, delay: Duration) {
        *self.drain_delay.lock().unwrap() = Some(delay);
    }

    pub fn drain_calls(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    pub async fn wait_for_drains(&self, n: usize) {
        wait_until(|| self.drain_calls() >= n, "drains").await;
    }
}

#[async_trait]
impl QueueService for FakeQueueService {
    async fn enqueue(&self, _endpoint: &str, _method: HttpMethod, _data: Option<Value>) -> bool {
        self.add_pending(1);
        true
    }

    async fn list_pending(&self) -> Vec<QueuedRequest> {
        Vec::new()
    }

    async fn drain(&self) -> DrainOutcome {
        self.draining.store(true, Ordering::SeqCst);
        let delay = *self.drain_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let pending = self.pending.send_replace(0);
        let failed = self.fail_next.swap(0, Ordering::SeqCst).min(pending);
        self.draining.store(false, Ordering::SeqCst);
        self.drains.fetch_add(1, Ordering::SeqCst);
        DrainOutcome {
            processed: pending - failed,
            failed,
        }
    }

    fn pending_count(&self) -> usize {
        *self.pending.borrow()
    }

    fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending.subscribe()
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn last_sync(&self) -> Option<DateTime<Utc>> {
        None
    }
}
