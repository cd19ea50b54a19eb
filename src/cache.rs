//! Read-side snapshots used when a fetch cannot reach the API.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::{debug, warn};

use crate::db::PartitionSpec;
use crate::models::CachedEntity;
use crate::store::DurableStore;

/// Where a read came from.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead<T> {
    Fresh(T),
    /// Last good snapshot, with the time it was stored.
    Cached(CachedEntity<T>),
}

impl<T> CacheRead<T> {
    pub fn into_data(self) -> T {
        match self {
            CacheRead::Fresh(data) => data,
            CacheRead::Cached(entity) => entity.data,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, CacheRead::Cached(_))
    }
}

#[derive(Clone)]
pub struct CacheStore {
    store: DurableStore,
    partition: PartitionSpec,
}

impl CacheStore {
    pub fn new(store: DurableStore, partition: PartitionSpec) -> Self {
        Self { store, partition }
    }

    /// Overwrite the snapshot for `key`.
    pub async fn put<T: Serialize>(&self, key: &str, data: &T) -> bool {
        let entity = CachedEntity {
            key: key.to_string(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        };
        self.store.put_as(self.partition.name, &entity).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CachedEntity<T>> {
        self.store.get_as(self.partition.name, key).await
    }

    /// Run `fetch`; store and return fresh data on success, otherwise fall
    /// back to the last snapshot. The error surfaces only when there is none.
    pub async fn fetch_or_cached<T, E, F, Fut>(&self, key: &str, fetch: F) -> Result<CacheRead<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match fetch().await {
            Ok(data) => {
                if !self.put(key, &data).await {
                    warn!(partition = self.partition.name, key, "failed to refresh snapshot");
                }
                Ok(CacheRead::Fresh(data))
            }
            Err(e) => match self.get::<T>(key).await {
                Some(entity) => {
                    debug!(partition = self.partition.name, key, error = %e, "serving cached snapshot");
                    Ok(CacheRead::Cached(entity))
                }
                None => Err(e),
            },
        }
    }

    pub async fn clear(&self) -> bool {
        self.store.clear(&[self.partition.name]).await
    }
}
