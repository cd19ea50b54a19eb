//! Pending-request counter kept in "local storage", outside the durable DB.
//!
//! Local storage is a small JSON file of string keys to string values,
//! rewritten on every change. The counter under `pendingSyncCount` is for
//! display only; the queue partition is the source of truth and the replay
//! engine overwrites the counter with the real queue size after every drain.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::warn;

pub const PENDING_COUNT_KEY: &str = "pendingSyncCount";
pub const LOCAL_STORAGE_FILE: &str = "local-storage.json";

pub struct LocalStorage {
    path: Option<PathBuf>,
    items: Mutex<BTreeMap<String, String>>,
}

impl LocalStorage {
    /// Load from `path`, starting empty if the file is missing or unreadable.
    pub fn open(path: &Path) -> Self {
        let items = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<BTreeMap<String, String>>(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "local storage file is corrupt, starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: Some(path.to_path_buf()),
            items: Mutex::new(items),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            items: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.items.lock().ok()?.get(key).cloned()
    }

    pub fn set_item(&self, key: &str, value: &str) -> bool {
        let Ok(mut items) = self.items.lock() else {
            return false;
        };
        items.insert(key.to_string(), value.to_string());
        self.persist(&items)
    }

    fn persist(&self, items: &BTreeMap<String, String>) -> bool {
        let Some(path) = &self.path else {
            return true;
        };
        let raw = match serde_json::to_string_pretty(items) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "local storage serialization failed");
                return false;
            }
        };
        // Write-then-rename so a crash never leaves a half-written file.
        let tmp = path.with_extension("json.tmp");
        if let Err(e) = fs::write(&tmp, raw).and_then(|_| fs::rename(&tmp, path)) {
            warn!(path = %path.display(), error = %e, "local storage write failed");
            return false;
        }
        true
    }
}

/// Display counter of queued requests, mirrored into local storage and
/// broadcast to UI subscribers.
#[derive(Clone)]
pub struct PendingCounter {
    storage: Arc<LocalStorage>,
    tx: Arc<watch::Sender<usize>>,
}

impl PendingCounter {
    pub fn new(storage: Arc<LocalStorage>) -> Self {
        let initial = read_count(&storage);
        let (tx, _rx) = watch::channel(initial);
        Self {
            storage,
            tx: Arc::new(tx),
        }
    }

    pub fn get(&self) -> usize {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.tx.subscribe()
    }

    pub fn increment(&self) -> usize {
        let mut next = 0;
        self.tx.send_modify(|count| {
            *count += 1;
            next = *count;
        });
        self.write(next);
        next
    }

    pub fn decrement(&self) -> usize {
        let mut next = 0;
        self.tx.send_modify(|count| {
            *count = count.saturating_sub(1);
            next = *count;
        });
        self.write(next);
        next
    }

    /// Overwrite with an authoritative value (the queue's real size).
    pub fn set(&self, value: usize) {
        self.tx.send_replace(value);
        self.write(value);
    }

    fn write(&self, value: usize) {
        if !self.storage.set_item(PENDING_COUNT_KEY, &value.to_string()) {
            warn!(value, "failed to persist pending counter");
        }
    }
}

fn read_count(storage: &LocalStorage) -> usize {
    storage
        .get_item(PENDING_COUNT_KEY)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .map(|n| n.max(0) as usize)
        .unwrap_or(0)
}
