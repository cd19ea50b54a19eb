//! Records persisted by the queue and cache, plus the messages exchanged with
//! the background-sync worker.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// HTTP verbs a queued mutation may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutating call that has not been confirmed by the server yet.
///
/// Wire shape in the `syncRequests` partition:
/// `{ id, endpoint, method, data?, timestamp, attempts }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest<T = Value> {
    pub id: String,
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Creation time in epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub attempts: u32,
}

impl<T> QueuedRequest<T> {
    pub fn new(endpoint: impl Into<String>, method: HttpMethod, data: Option<T>) -> Self {
        let now_ms = Utc::now().timestamp_millis();
        Self {
            id: new_request_id(now_ms),
            endpoint: endpoint.into(),
            method,
            data,
            timestamp: now_ms,
            attempts: 0,
        }
    }
}

/// `<epoch-ms>-<random>`; the uuid suffix keeps ids unique within one millisecond.
pub fn new_request_id(now_ms: i64) -> String {
    format!("{now_ms}-{}", Uuid::new_v4().simple())
}

/// Aggregate result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainOutcome {
    pub processed: usize,
    pub failed: usize,
}

impl DrainOutcome {
    pub fn is_empty(&self) -> bool {
        self.processed == 0 && self.failed == 0
    }
}

/// Read-side snapshot used as an offline fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity<T = Value> {
    pub key: String,
    pub data: T,
    pub timestamp: i64,
}

/// Messages exchanged between the page-side engine and the background worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
    BackgroundSync { tag: String },
    SyncCompleted { processed: usize, failed: usize },
    SyncFailed { processed: usize, failed: usize },
}

impl SyncMessage {
    /// Reply posted back to the worker after a background-triggered drain.
    pub fn from_outcome(outcome: DrainOutcome) -> Self {
        if outcome.failed > 0 {
            SyncMessage::SyncFailed {
                processed: outcome.processed,
                failed: outcome.failed,
            }
        } else {
            SyncMessage::SyncCompleted {
                processed: outcome.processed,
                failed: outcome.failed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_request_ids_unique_within_same_millisecond() {
        let ids: HashSet<String> = (0..1_000).map(|_| new_request_id(1_700_000_000_000)).collect();
        assert_eq!(ids.len(), 1_000);
        assert!(ids.iter().all(|id| id.starts_with("1700000000000-")));
    }

    #[test]
    fn test_queued_request_wire_shape() {
        let req = QueuedRequest::new(
            "https://api.example.com/pagos",
            HttpMethod::Post,
            Some(serde_json::json!({ "monto": 50 })),
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["attempts"], 0);
        assert_eq!(json["data"]["monto"], 50);
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_delete_without_data_omits_field() {
        let req: QueuedRequest = QueuedRequest::new("/usuarios/7", HttpMethod::Delete, None);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("data").is_none());

        let back: QueuedRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.data, None);
        assert_eq!(back.method, HttpMethod::Delete);
    }

    #[test]
    fn test_sync_message_tags() {
        let msg: SyncMessage =
            serde_json::from_str(r#"{"type":"BACKGROUND_SYNC","tag":"sync-requests"}"#).unwrap();
        assert_eq!(
            msg,
            SyncMessage::BackgroundSync {
                tag: "sync-requests".into()
            }
        );

        let reply = SyncMessage::from_outcome(DrainOutcome {
            processed: 2,
            failed: 1,
        });
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "SYNC_FAILED");
        assert_eq!(json["processed"], 2);
    }
}
