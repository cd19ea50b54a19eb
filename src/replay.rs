//! Replay engine: drains the queue against the network.
//!
//! Entries are replayed one at a time. A 2xx response deletes the entry; any
//! other response, or no response at all, bumps `attempts` and either books
//! the entry back or drops it once the ceiling is hit. The counter is
//! recomputed from the queue size at the end of every pass.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::credentials::TokenSource;
use crate::db::SYNC_REQUESTS;
use crate::error::{SyncError, SyncResult};
use crate::models::{DrainOutcome, HttpMethod, QueuedRequest};
use crate::queue::SyncQueue;
use crate::transport::{is_success_status, status_error, OutboundRequest, Transport};

/// Key of a raw queue record, if it has a usable one.
fn record_id(record: &Value) -> Option<String> {
    match record.get(SYNC_REQUESTS.key_path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Failed attempts after which an entry is dropped.
pub const MAX_ATTEMPTS: u32 = 3;

/// How failures count against the retry ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Every failure is retried until the ceiling, whatever the cause.
    #[default]
    Uniform,
    /// Like `Uniform`, but a 4xx response (other than 408/429) drops the
    /// entry on the first attempt.
    GiveUpOnClientError,
}

impl RetryPolicy {
    fn is_permanent(&self, status: Option<u16>) -> bool {
        match (self, status) {
            (RetryPolicy::GiveUpOnClientError, Some(s)) => {
                (400..500).contains(&s) && s != 408 && s != 429
            }
            _ => false,
        }
    }
}

impl FromStr for RetryPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uniform" => Ok(RetryPolicy::Uniform),
            "give_up_on_client_error" | "give-up-on-client-error" => {
                Ok(RetryPolicy::GiveUpOnClientError)
            }
            other => Err(SyncError::Config(format!("unknown retry policy: {other}"))),
        }
    }
}

enum Attempt {
    Applied,
    Failed { status: Option<u16>, reason: String },
}

pub struct ReplayEngine {
    queue: SyncQueue,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenSource>,
    policy: RetryPolicy,
    max_attempts: u32,
    drain_lock: tokio::sync::Mutex<()>,
    last_drain: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl ReplayEngine {
    pub fn new(
        queue: SyncQueue,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenSource>,
        policy: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            transport,
            tokens,
            policy,
            max_attempts: max_attempts.max(1),
            drain_lock: tokio::sync::Mutex::new(()),
            last_drain: std::sync::Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// True while a drain pass holds the lock.
    pub fn is_draining(&self) -> bool {
        self.drain_lock.try_lock().is_err()
    }

    pub fn last_drain_at(&self) -> Option<DateTime<Utc>> {
        self.last_drain.lock().ok().and_then(|guard| *guard)
    }

    /// Replay every pending entry once.
    ///
    /// Overlapping calls are serialized: a second trigger waits for the
    /// running pass and then drains whatever is left.
    pub async fn drain(&self) -> DrainOutcome {
        let _guard = self.drain_lock.lock().await;
        let store = self.queue.store();

        if !store.has_partition(SYNC_REQUESTS.name).await {
            store.ensure_partition(SYNC_REQUESTS).await;
            debug!("sync queue partition created on first drain");
            return DrainOutcome::default();
        }

        let records = store.get_all(SYNC_REQUESTS.name).await;
        if records.is_empty() {
            self.reconcile_counter().await;
            return DrainOutcome::default();
        }

        info!(pending = records.len(), "draining sync queue");
        let mut outcome = DrainOutcome::default();

        for record in records {
            let mut entry = match serde_json::from_value::<QueuedRequest>(record.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    // Never replayable; drop it so it cannot pin the counter.
                    let id = record_id(&record);
                    warn!(id = ?id, error = %e, "dropping unreadable queued request");
                    match id {
                        Some(id) if store.delete(SYNC_REQUESTS.name, &id).await => {
                            outcome.failed += 1;
                        }
                        _ => warn!("unreadable queued request could not be removed"),
                    }
                    continue;
                }
            };
            match self.replay_one(&entry).await {
                Attempt::Applied => {
                    if !store.delete(SYNC_REQUESTS.name, &entry.id).await {
                        warn!(id = %entry.id, "applied request could not be removed; it may be replayed again");
                    }
                    self.queue.counter().decrement();
                    outcome.processed += 1;
                }
                Attempt::Failed { status, reason } => {
                    entry.attempts = entry.attempts.saturating_add(1);
                    let permanent = self.policy.is_permanent(status);
                    if entry.attempts >= self.max_attempts || permanent {
                        warn!(
                            id = %entry.id,
                            method = %entry.method,
                            endpoint = %entry.endpoint,
                            attempts = entry.attempts,
                            permanent,
                            reason = %reason,
                            "giving up on queued request"
                        );
                        if store.delete(SYNC_REQUESTS.name, &entry.id).await {
                            outcome.failed += 1;
                        } else {
                            // Keep the bumped count so the next pass retries the removal.
                            warn!(id = %entry.id, "dropped request could not be removed; will retry");
                            store.put_as(SYNC_REQUESTS.name, &entry).await;
                        }
                    } else {
                        debug!(
                            id = %entry.id,
                            attempts = entry.attempts,
                            reason = %reason,
                            "replay failed; keeping request for next drain"
                        );
                        if !store.put_as(SYNC_REQUESTS.name, &entry).await {
                            warn!(id = %entry.id, "failed to record replay attempt");
                        }
                    }
                }
            }
        }

        let remaining = self.reconcile_counter().await;
        if let Ok(mut guard) = self.last_drain.lock() {
            *guard = Some(Utc::now());
        }
        info!(
            processed = outcome.processed,
            failed = outcome.failed,
            remaining,
            "sync queue drain complete"
        );
        outcome
    }

    /// Send a single request without touching the queue. Used for the first
    /// attempt of a mutation before it is queued.
    pub async fn send_once(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> SyncResult<u16> {
        let token = self.current_token().await;
        self.transport
            .send(OutboundRequest {
                method,
                endpoint,
                body,
                bearer: token.as_deref().map(String::as_str),
            })
            .await
    }

    /// Token lookups may hit the OS keyring, so they run on the blocking pool.
    async fn current_token(&self) -> Option<Zeroizing<String>> {
        let tokens = self.tokens.clone();
        match tokio::task::spawn_blocking(move || tokens.bearer_token()).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "bearer token lookup failed");
                None
            }
        }
    }

    async fn replay_one(&self, entry: &QueuedRequest) -> Attempt {
        // Read the token now, not at enqueue time: it may have rotated.
        match self
            .send_once(entry.method, &entry.endpoint, entry.data.as_ref())
            .await
        {
            Ok(status) if is_success_status(status) => Attempt::Applied,
            Ok(status) => Attempt::Failed {
                status: Some(status),
                reason: status_error(status),
            },
            Err(e) => Attempt::Failed {
                status: None,
                reason: e.to_string(),
            },
        }
    }

    /// Overwrite the counter with the real queue size.
    async fn reconcile_counter(&self) -> usize {
        let remaining = self.queue.len().await;
        self.queue.counter().set(remaining);
        remaining
    }
}
