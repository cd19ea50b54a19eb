//! Partitioned key-value store on top of the SQLite layer.
//!
//! Every operation runs on the blocking pool in its own transaction and never
//! returns an error to the caller: failures are logged and reported as
//! `false`, `None`, or an empty list.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::{self, DbState, PartitionSpec};
use crate::error::{SyncError, SyncResult};

#[derive(Clone)]
pub struct DurableStore {
    db: Arc<DbState>,
}

impl DurableStore {
    pub fn new(db: DbState) -> Self {
        Self { db: Arc::new(db) }
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut Connection) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .conn
                .lock()
                .map_err(|e| SyncError::Worker(e.to_string()))?;
            f(&mut conn)
        })
        .await?
    }

    /// Upsert `record` keyed by the partition's key path.
    pub async fn put(&self, partition: &str, record: &Value) -> bool {
        let name = partition.to_string();
        let record = record.clone();
        match self.with_conn(move |conn| put_record(conn, &name, &record)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(partition, error = %e, "store put failed");
                false
            }
        }
    }

    pub async fn put_as<T: Serialize>(&self, partition: &str, record: &T) -> bool {
        match serde_json::to_value(record) {
            Ok(value) => self.put(partition, &value).await,
            Err(e) => {
                warn!(partition, error = %e, "store put: record is not serializable");
                false
            }
        }
    }

    /// Fetch one record; `None` when the key (or the partition) is absent.
    pub async fn get(&self, partition: &str, key: &str) -> Option<Value> {
        let name = partition.to_string();
        let key_owned = key.to_string();
        let result = self
            .with_conn(move |conn| {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT value FROM records WHERE partition = ?1 AND record_key = ?2",
                        params![name, key_owned],
                        |row| row.get(0),
                    )
                    .optional()?;
                match raw {
                    Some(raw) => Ok(Some(serde_json::from_str::<Value>(&raw)?)),
                    None => Ok(None),
                }
            })
            .await;
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(partition, key, error = %e, "store get failed");
                None
            }
        }
    }

    pub async fn get_as<T: DeserializeOwned>(&self, partition: &str, key: &str) -> Option<T> {
        let value = self.get(partition, key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(partition, key, error = %e, "store get: record has unexpected shape");
                None
            }
        }
    }

    /// Every record in the partition in insertion order. Empty when the
    /// partition is empty, missing, or unreadable.
    pub async fn get_all(&self, partition: &str) -> Vec<Value> {
        let name = partition.to_string();
        let result = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT value FROM records WHERE partition = ?1 ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map(params![name], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut values = Vec::with_capacity(rows.len());
                for raw in rows {
                    values.push(serde_json::from_str::<Value>(&raw)?);
                }
                Ok(values)
            })
            .await;
        match result {
            Ok(values) => values,
            Err(e) => {
                warn!(partition, error = %e, "store get_all failed");
                Vec::new()
            }
        }
    }

    /// Typed `get_all`; records that do not match `T` are skipped and logged.
    pub async fn get_all_as<T: DeserializeOwned>(&self, partition: &str) -> Vec<T> {
        self.get_all(partition)
            .await
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<T>(value) {
                Ok(typed) => Some(typed),
                Err(e) => {
                    warn!(partition, error = %e, "skipping record with unexpected shape");
                    None
                }
            })
            .collect()
    }

    /// Remove a record. Deleting a missing key succeeds.
    pub async fn delete(&self, partition: &str, key: &str) -> bool {
        let name = partition.to_string();
        let key_owned = key.to_string();
        let result = self
            .with_conn(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM records WHERE partition = ?1 AND record_key = ?2",
                    params![name, key_owned],
                )?;
                Ok(removed)
            })
            .await;
        match result {
            Ok(removed) => {
                debug!(partition, key, removed, "store delete");
                true
            }
            Err(e) => {
                warn!(partition, key, error = %e, "store delete failed");
                false
            }
        }
    }

    /// Wipe all listed partitions in a single transaction.
    pub async fn clear(&self, partitions: &[&str]) -> bool {
        let names: Vec<String> = partitions.iter().map(|p| p.to_string()).collect();
        let result = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let mut removed = 0usize;
                for name in &names {
                    removed += tx.execute(
                        "DELETE FROM records WHERE partition = ?1",
                        params![name],
                    )?;
                }
                tx.commit()?;
                Ok(removed)
            })
            .await;
        match result {
            Ok(removed) => {
                debug!(partitions = partitions.len(), removed, "store cleared");
                true
            }
            Err(e) => {
                warn!(error = %e, "store clear failed");
                false
            }
        }
    }

    /// Number of records in the partition; 0 when unreadable.
    pub async fn count(&self, partition: &str) -> usize {
        let name = partition.to_string();
        let result = self
            .with_conn(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM records WHERE partition = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(count.max(0) as usize)
            })
            .await;
        match result {
            Ok(count) => count,
            Err(e) => {
                warn!(partition, error = %e, "store count failed");
                0
            }
        }
    }

    pub async fn has_partition(&self, partition: &str) -> bool {
        let name = partition.to_string();
        self.with_conn(move |conn| Ok(db::partition_key_path(conn, &name)?.is_some()))
            .await
            .unwrap_or(false)
    }

    /// Create the partition if missing. Existing data is left untouched.
    pub async fn ensure_partition(&self, spec: PartitionSpec) -> bool {
        match self
            .with_conn(move |conn| db::ensure_partition(conn, &spec))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(partition = spec.name, error = %e, "ensure partition failed");
                false
            }
        }
    }
}

/// String form of the record's key field. Numbers are accepted and
/// stringified; anything else is rejected.
fn record_key(record: &Value, key_path: &str) -> Option<String> {
    match record.get(key_path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn put_record(conn: &mut Connection, partition: &str, record: &Value) -> SyncResult<()> {
    let tx = conn.transaction()?;
    let key_path = db::partition_key_path(&tx, partition)?
        .ok_or_else(|| SyncError::UnknownPartition(partition.to_string()))?;
    let key = record_key(record, &key_path).ok_or_else(|| SyncError::MissingKey {
        partition: partition.to_string(),
        key_path: key_path.clone(),
    })?;
    let raw = serde_json::to_string(record)?;

    // Upserts keep the original `seq` so enumeration order stays stable.
    tx.execute(
        "INSERT INTO records (partition, record_key, value, seq)
         VALUES (?1, ?2, ?3,
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM records WHERE partition = ?1))
         ON CONFLICT(partition, record_key) DO UPDATE SET
             value = excluded.value,
             updated_at = datetime('now')",
        params![partition, key, raw],
    )?;
    tx.commit()?;
    Ok(())
}
