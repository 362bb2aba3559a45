//! Memoization of expensive aggregate queries.
//!
//! Backends speak JSON values and report failures; [`CacheHandle`] is what the
//! engines hold and it never lets a failure escape. A broken cache behaves like
//! an empty one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{InstanceKey, Keyword};
use crate::AppError;

pub mod sqlite;

pub use sqlite::SqliteCache;

/// Logical store holding query results.
pub const QUERY_STORE: &str = "query_results";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("value is not JSON serializable: {0}")]
    Serialization(String),
    #[error("cache storage failure: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        CacheError::Storage(AppError::from(err).to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        AppError::new(AppError::CACHE_FAILURE, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub store: String,
    pub entries: u64,
    pub bytes: u64,
}

pub trait CacheBackend: Send + Sync {
    fn get<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>, CacheError>>;
    fn put<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
    fn delete<'a>(&'a self, store: &'a str, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>>;
    fn clear<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<(), CacheError>>;
    fn stats(&self) -> BoxFuture<'_, Result<Vec<StoreStats>, CacheError>>;
    /// Releases the underlying resource. A no-op when nothing was opened.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Process-local backend. Values are kept as serialized text so a stored value
/// never aliases the caller's data.
#[derive(Default)]
pub struct MemoryCache {
    data: Mutex<HashMap<(String, String), String>>,
}

impl CacheBackend for MemoryCache {
    fn get<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>, CacheError>> {
        Box::pin(async move {
            let raw = self
                .data
                .lock()
                .map(|guard| guard.get(&(store.to_string(), key.to_string())).cloned())
                .unwrap_or_default();
            match raw {
                Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                None => Ok(None),
            }
        })
    }

    fn put<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let text = serde_json::to_string(&value)?;
            let mut guard = self
                .data
                .lock()
                .map_err(|_| CacheError::Storage("memory cache poisoned".into()))?;
            guard.insert((store.to_string(), key.to_string()), text);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, store: &'a str, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            if let Ok(mut guard) = self.data.lock() {
                guard.remove(&(store.to_string(), key.to_string()));
            }
            Ok(())
        })
    }

    fn clear<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            if let Ok(mut guard) = self.data.lock() {
                guard.retain(|(entry_store, _), _| entry_store != store);
            }
            Ok(())
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<Vec<StoreStats>, CacheError>> {
        Box::pin(async move {
            let mut by_store: HashMap<String, StoreStats> = HashMap::new();
            if let Ok(guard) = self.data.lock() {
                for ((store, _), text) in guard.iter() {
                    let entry = by_store.entry(store.clone()).or_insert_with(|| StoreStats {
                        store: store.clone(),
                        entries: 0,
                        bytes: 0,
                    });
                    entry.entries += 1;
                    entry.bytes += text.len() as u64;
                }
            }
            let mut stats: Vec<StoreStats> = by_store.into_values().collect();
            stats.sort_by(|a, b| a.store.cmp(&b.store));
            Ok(stats)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Cache key namespaced by the instance triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a named aggregate, e.g. `(server, database, table, keyword, "count")`.
    pub fn for_instance(instance: &InstanceKey, keyword: Option<Keyword>, suffix: &str) -> Self {
        let parts = [
            instance.server.as_str(),
            instance.database.as_str(),
            instance.table.as_str(),
            keyword.map(Keyword::as_str).unwrap_or(""),
            suffix,
        ];
        // JSON array encoding keeps components with separators in them unambiguous.
        let encoded = serde_json::to_string(&parts).unwrap_or_else(|_| parts.join("|"));
        CacheKey(encoded)
    }

    /// Key for a query result; formatting differences in `query_text` collapse
    /// onto the same entry.
    pub fn for_query(instance: &InstanceKey, keyword: Option<Keyword>, query_text: &str) -> Self {
        let digest = Sha256::digest(normalize_query(query_text).as_bytes());
        Self::for_instance(instance, keyword, &format!("q:{digest:x}"))
    }

    pub fn raw(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Collapses every whitespace run to a single space and trims the ends.
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Clone)]
pub struct CacheHandle {
    inner: Arc<dyn CacheBackend>,
    store: Arc<str>,
}

impl CacheHandle {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_store(backend, QUERY_STORE)
    }

    pub fn with_store(backend: Arc<dyn CacheBackend>, store: &str) -> Self {
        Self {
            inner: backend,
            store: Arc::from(store),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::default()))
    }

    pub fn sqlite(cache: SqliteCache) -> Self {
        Self::new(Arc::new(cache))
    }

    /// Another logical store sharing this handle's backend.
    pub fn store(&self, store: &str) -> Self {
        Self::with_store(self.inner.clone(), store)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        match self.inner.get(&self.store, key.as_str()).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(decoded) => {
                    debug!(target: "waterfall", event = "cache_hit", store = %self.store, key = key.as_str());
                    Some(decoded)
                }
                Err(err) => {
                    warn!(
                        target: "waterfall",
                        event = "cache_decode_failed",
                        store = %self.store,
                        key = key.as_str(),
                        error = %err
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(
                    target: "waterfall",
                    event = "cache_get_failed",
                    store = %self.store,
                    key = key.as_str(),
                    error = %err
                );
                None
            }
        }
    }

    pub async fn put<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) {
        let plain = match serde_json::to_value(value) {
            Ok(plain) => plain,
            Err(err) => {
                let err = CacheError::from(err);
                warn!(
                    target: "waterfall",
                    event = "cache_serialize_failed",
                    store = %self.store,
                    key = key.as_str(),
                    error = %err
                );
                return;
            }
        };
        if let Err(err) = self.inner.put(&self.store, key.as_str(), plain).await {
            warn!(
                target: "waterfall",
                event = "cache_put_failed",
                store = %self.store,
                key = key.as_str(),
                error = %err
            );
        }
    }

    pub async fn delete(&self, key: &CacheKey) {
        if let Err(err) = self.inner.delete(&self.store, key.as_str()).await {
            warn!(
                target: "waterfall",
                event = "cache_delete_failed",
                store = %self.store,
                key = key.as_str(),
                error = %err
            );
        }
    }

    pub async fn clear(&self) {
        if let Err(err) = self.inner.clear(&self.store).await {
            warn!(target: "waterfall", event = "cache_clear_failed", store = %self.store, error = %err);
        }
    }

    pub async fn stats(&self) -> Vec<StoreStats> {
        match self.inner.stats().await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(target: "waterfall", event = "cache_stats_failed", error = %err);
                Vec::new()
            }
        }
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }
}
