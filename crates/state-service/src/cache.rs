//! Read-through cache over the shared store.
//!
//! Entries are JSON payloads under `cache:{key}` with a TTL. Reads and
//! writes are best-effort: an outage looks like a miss and a failed write is
//! dropped. Invalidation is the exception and fails loudly, because a
//! caller that just mutated the source of truth must know whether stale data
//! can still be served.

use crate::errors::StateError;
use crate::observability::metrics;
use crate::store::StoreAdapter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Key prefix for cache entries.
pub const CACHE_PREFIX: &str = "cache:";

/// Cache key for a user's chat history.
pub fn chat_history_key(user_id: &str) -> String {
    format!("chat_history:{user_id}")
}

/// Cache key for a user's media analysis history.
pub fn media_history_key(user_id: &str) -> String {
    format!("media_history:{user_id}")
}

fn entry_key(key: &str) -> String {
    format!("{CACHE_PREFIX}{key}")
}

/// TTL-bound memoization with explicit invalidation.
#[derive(Debug, Clone)]
pub struct CacheManager {
    store: StoreAdapter,
    default_ttl: Duration,
}

impl CacheManager {
    pub fn new(store: StoreAdapter, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read a cached value. Store failures and undecodable payloads are a miss.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = entry_key(key);
        let raw = match self.store.get(&full_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                metrics::record_cache_lookup("miss");
                return None;
            }
            Err(e) => {
                warn!(target: "state.cache", error = %e, "Cache read failed, treating as miss");
                metrics::record_cache_lookup("error");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                metrics::record_cache_lookup("hit");
                Some(value)
            }
            Err(e) => {
                warn!(target: "state.cache", error = %e, "Cached payload undecodable, dropping");
                metrics::record_cache_lookup("error");
                if let Err(e) = self.store.delete(&full_key).await {
                    debug!(target: "state.cache", error = %e, "Failed to drop undecodable entry");
                }
                None
            }
        }
    }

    /// Write a value. Returns `false` if it could not be stored.
    ///
    /// `ttl = None` uses the configured default.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(target: "state.cache", error = %e, "Failed to serialize cache value");
                return false;
            }
        };

        let ttl = ttl.unwrap_or(self.default_ttl);
        match self.store.set(&entry_key(key), &payload, Some(ttl)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "state.cache", error = %e, "Cache write failed");
                false
            }
        }
    }

    /// Remove an entry. After `Ok`, no reader sees the old value.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StoreUnavailable` if the delete cannot be confirmed.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn invalidate(&self, key: &str) -> Result<(), StateError> {
        self.store.delete(&entry_key(key)).await?;
        debug!(target: "state.cache", "Cache entry invalidated");
        Ok(())
    }

    /// Remove every entry whose key starts with `prefix`. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StoreUnavailable` on the first failed scan or
    /// delete. Entries deleted before the failure stay deleted.
    #[instrument(skip_all, fields(prefix = %prefix))]
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, StateError> {
        let keys = self.store.scan_prefix(&entry_key(prefix)).await?;
        let mut removed = 0;
        for key in &keys {
            if self.store.delete(key).await? {
                removed += 1;
            }
        }
        info!(target: "state.cache", removed = removed, "Cache prefix invalidated");
        Ok(removed)
    }

    /// Return the cached value, or compute it, cache it and return it.
    ///
    /// A cache outage means recomputation, never failure.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `compute`.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }
}
