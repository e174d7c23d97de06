//! Store adapter over the shared key-value store.
//!
//! This module provides:
//! - [`KeyValueStore`] - the backend trait (Redis and in-memory implementations)
//! - [`StoreAdapter`] - the single entry point every component uses, which
//!   applies the per-call timeout, transient-failure retry with backoff, and
//!   translation into [`StateError`]
//!
//! # Key Patterns
//!
//! - `session:{key}` - Session record (JSON, TTL = sliding lifetime)
//! - `session-index:{user_id}` - Session keys issued to a user (SET)
//! - `rate:{action}:{client}:{window}` - Fixed-window counter (TTL = window)
//! - `cache:{key}` - Cached payload (JSON)
//! - `{queue}:pending` - Task queue (ZSET, score = priority rank then sequence)
//! - `{queue}:sequence` - Task sequence counter
//!
//! # Consistency
//!
//! Only single-key read-after-write from the same process is assumed. No
//! component relies on cross-key transactions.

mod lua_scripts;
pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::config::StorePolicy;
use crate::errors::StateError;
use crate::observability::metrics;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, warn};

/// Failure reported by a [`KeyValueStore`] backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection, IO or timeout failure. Worth retrying.
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// The store answered but refused the command (e.g. wrong value type).
    #[error("store rejected command: {0}")]
    Rejected(String),
}

impl BackendError {
    fn kind(&self) -> &'static str {
        match self {
            BackendError::Unavailable(_) => "unavailable",
            BackendError::Rejected(_) => "rejected",
        }
    }
}

/// Backend operations required by the orchestration layer.
///
/// Implementations must be safe to call concurrently and must apply TTLs
/// atomically with the write they accompany.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Write a string value, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), BackendError>;

    /// Overwrite a value only if the key currently exists.
    ///
    /// Returns `false` when the key was absent and nothing was written.
    async fn set_if_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// Atomically increment a counter, applying `ttl` only when the counter
    /// is created by this call. Returns the post-increment value.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, BackendError>;

    /// Add or re-score a sorted-set member.
    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), BackendError>;

    /// Atomically remove and return up to `count` lowest-scored members.
    async fn sorted_pop_min(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<(String, f64)>, BackendError>;

    /// Return up to `count` lowest-scored members without removing them.
    async fn sorted_range(&self, key: &str, count: usize) -> Result<Vec<String>, BackendError>;

    async fn sorted_len(&self, key: &str) -> Result<u64, BackendError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BackendError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BackendError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError>;

    /// List every key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;
}

/// Result of a store health probe.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHealth {
    pub healthy: bool,
    pub latency: Duration,
    /// Client-safe failure description.
    pub error: Option<String>,
}

/// The single serialization point for retry/backoff policy.
///
/// Cheaply cloneable; every component holds its own clone.
#[derive(Clone)]
pub struct StoreAdapter {
    backend: Arc<dyn KeyValueStore>,
    policy: StorePolicy,
}

impl std::fmt::Debug for StoreAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreAdapter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl StoreAdapter {
    pub fn new(backend: Arc<dyn KeyValueStore>, policy: StorePolicy) -> Self {
        Self { backend, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &StorePolicy {
        &self.policy
    }

    /// Run one backend operation under the timeout and retry policy.
    ///
    /// A timed-out attempt may still have run on the server. Operations that
    /// change state on every run (`incr`, `sorted_pop_min`) are therefore
    /// called with `idempotent = false` and get a single attempt.
    async fn call<'a, T, F, Fut>(
        &'a self,
        operation: &'static str,
        idempotent: bool,
        op: F,
    ) -> Result<T, StateError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>> + 'a,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.policy.op_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Unavailable(format!(
                    "timed out after {}ms",
                    self.policy.op_timeout.as_millis()
                ))),
            };
            metrics::record_store_latency(operation, started.elapsed());

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            metrics::record_store_failure(operation, err.kind());

            match err {
                BackendError::Rejected(msg) => {
                    error!(
                        target: "state.store",
                        operation = operation,
                        error = %msg,
                        "Store rejected operation"
                    );
                    return Err(StateError::Malformed(format!("{operation}: {msg}")));
                }
                BackendError::Unavailable(msg) if !idempotent || attempt >= max_attempts => {
                    error!(
                        target: "state.store",
                        operation = operation,
                        attempts = attempt,
                        idempotent = idempotent,
                        error = %msg,
                        "Store operation failed"
                    );
                    return Err(StateError::StoreUnavailable(format!("{operation}: {msg}")));
                }
                BackendError::Unavailable(msg) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        target: "state.store",
                        operation = operation,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "Store operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Exponential backoff with up to 100ms of jitter, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.policy.retry_base_delay.saturating_mul(1u32 << exponent);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=100));
        base.saturating_add(jitter).min(self.policy.retry_max_delay)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        self.call("get", true, || self.backend.get(key)).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        self.call("set", true, || self.backend.set(key, value, ttl)).await
    }

    pub async fn set_if_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError> {
        self.call("set_if_exists", true, || {
            self.backend.set_if_exists(key, value, ttl)
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StateError> {
        self.call("del", true, || self.backend.delete(key)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StateError> {
        self.call("exists", true, || self.backend.exists(key)).await
    }

    /// Increment a counter. Never retried.
    pub async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StateError> {
        self.call("incr", false, || self.backend.incr(key, ttl)).await
    }

    pub async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), StateError> {
        self.call("zadd", true, || self.backend.sorted_add(key, member, score))
            .await
    }

    /// Pop the lowest-scored members. Never retried: a pop whose reply was
    /// lost has already removed them.
    pub async fn sorted_pop_min(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<(String, f64)>, StateError> {
        self.call("zpopmin", false, || self.backend.sorted_pop_min(key, count))
            .await
    }

    pub async fn sorted_range(&self, key: &str, count: usize) -> Result<Vec<String>, StateError> {
        self.call("zrange", true, || self.backend.sorted_range(key, count))
            .await
    }

    pub async fn sorted_len(&self, key: &str) -> Result<u64, StateError> {
        self.call("zcard", true, || self.backend.sorted_len(key)).await
    }

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), StateError> {
        self.call("sadd", true, || self.backend.set_add(key, member)).await
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Result<(), StateError> {
        self.call("srem", true, || self.backend.set_remove(key, member)).await
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, StateError> {
        self.call("smembers", true, || self.backend.set_members(key)).await
    }

    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StateError> {
        self.call("scan", true, || self.backend.scan_prefix(prefix)).await
    }

    /// Probe the backend once (no retries). Never fails.
    pub async fn health_check(&self) -> StoreHealth {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.policy.op_timeout, self.backend.ping()).await;
        let latency = started.elapsed();

        match outcome {
            Ok(Ok(())) => StoreHealth {
                healthy: true,
                latency,
                error: None,
            },
            Ok(Err(e)) => {
                warn!(target: "state.store", error = %e, "Store health check failed");
                StoreHealth {
                    healthy: false,
                    latency,
                    error: Some("store unreachable".to_string()),
                }
            }
            Err(_) => {
                warn!(target: "state.store", "Store health check timed out");
                StoreHealth {
                    healthy: false,
                    latency,
                    error: Some("store timed out".to_string()),
                }
            }
        }
    }
}
