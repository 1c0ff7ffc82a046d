//! Expiring cache persisted in the store's cache column.
//!
//! Values are JSON. Refreshes are single-flight per key: concurrent callers
//! of an expired key wait for one computation and read its stored result.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chainidx_index::CacheEntry;
use chainidx_log::{log_debug, log_warn};
use chainidx_primitives::{decode, encode};
use chainidx_storage::{Column, KeyValueStore};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache computation failed: {0}")]
    Compute(String),
    #[error("cache computation timed out after {0:?}")]
    Timeout(Duration),
    #[error("cache store: {0}")]
    Store(String),
    #[error("cache value: {0}")]
    Codec(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StalePolicy {
    Fail,
    /// Fall back to an expired value when the refresh fails or times out.
    ServeStale,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub stale: bool,
    pub updated_ms: u64,
}

pub struct TtlCache {
    store: Arc<dyn KeyValueStore>,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    closed: AtomicBool,
    compute_timeout: Duration,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn decode_value<T: DeserializeOwned>(entry: &CacheEntry) -> Result<T, CacheError> {
    serde_json::from_slice(&entry.value).map_err(|err| CacheError::Codec(err.to_string()))
}

impl TtlCache {
    pub fn new(store: Arc<dyn KeyValueStore>, compute_timeout: Duration) -> Self {
        Self {
            store,
            flights: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            compute_timeout,
        }
    }

    /// Computations still finish after this, but their results are not stored.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let Some(bytes) = self
            .store
            .get(Column::Cache, key.as_bytes())
            .map_err(|err| CacheError::Store(err.to_string()))?
        else {
            return Ok(None);
        };
        decode(&bytes)
            .map(Some)
            .map_err(|err| CacheError::Codec(err.to_string()))
    }

    fn write_entry<T: Serialize>(&self, key: &str, ttl: Duration, value: &T) -> Result<u64, CacheError> {
        let updated_ms = now_ms();
        if self.is_closed() {
            log_debug!("discarding cache write for {key} after shutdown");
            return Ok(updated_ms);
        }
        let entry = CacheEntry {
            value: serde_json::to_vec(value).map_err(|err| CacheError::Codec(err.to_string()))?,
            updated_ms,
            ttl_ms: ttl.as_millis() as u64,
        };
        self.store
            .put(Column::Cache, key.as_bytes(), &encode(&entry))
            .map_err(|err| CacheError::Store(err.to_string()))?;
        Ok(updated_ms)
    }

    fn flight(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.flights.lock() {
            Ok(mut flights) => Arc::clone(flights.entry(key.to_string()).or_default()),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn release(&self, key: &str, flight: &Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut flights) = self.flights.lock() {
            // Held by the map and by us only: nobody else is waiting.
            if Arc::strong_count(flight) <= 2 {
                flights.remove(key);
            }
        }
    }

    pub async fn get_or_refresh<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.get_or_refresh_with(key, ttl, StalePolicy::Fail, compute)
            .await
            .map(|cached| cached.value)
    }

    pub async fn get_or_refresh_with<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        policy: StalePolicy,
        compute: F,
    ) -> Result<Cached<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if let Some(entry) = self.read_entry(key)? {
            if entry.is_fresh(now_ms()) {
                return Ok(Cached {
                    value: decode_value(&entry)?,
                    stale: false,
                    updated_ms: entry.updated_ms,
                });
            }
        }

        let flight = self.flight(key);
        let guard = flight.lock().await;
        let result = self.refresh(key, ttl, policy, compute).await;
        drop(guard);
        self.release(key, &flight);
        result
    }

    async fn refresh<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        policy: StalePolicy,
        compute: F,
    ) -> Result<Cached<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        // The flight we waited on may have refreshed the entry already.
        let existing = self.read_entry(key)?;
        if let Some(entry) = &existing {
            if entry.is_fresh(now_ms()) {
                return Ok(Cached {
                    value: decode_value(entry)?,
                    stale: false,
                    updated_ms: entry.updated_ms,
                });
            }
        }

        let failure = match tokio::time::timeout(self.compute_timeout, compute()).await {
            Ok(Ok(value)) => {
                let updated_ms = self.write_entry(key, ttl, &value)?;
                return Ok(Cached {
                    value,
                    stale: false,
                    updated_ms,
                });
            }
            Ok(Err(err)) => CacheError::Compute(err.to_string()),
            Err(_) => CacheError::Timeout(self.compute_timeout),
        };
        match (policy, existing) {
            (StalePolicy::ServeStale, Some(entry)) => {
                log_warn!("serving stale cache entry {key}: {failure}");
                Ok(Cached {
                    value: decode_value(&entry)?,
                    stale: true,
                    updated_ms: entry.updated_ms,
                })
            }
            _ => Err(failure),
        }
    }
}
