//! Fault-injecting [`KeyValueStore`] wrapper.
//!
//! Wraps a real backend (usually `MemoryStore`) and makes calls fail or
//! stall on demand, so tests can drive the store adapter's retry path and
//! each component's degradation policy.
//!
//! # Example
//!
//! ```rust,ignore
//! let flaky = FlakyStore::new(MemoryStore::new(clock));
//! flaky.fail_next(2);              // next two calls are transient failures
//! flaky.fail_operation("incr");    // every incr fails until cleared
//! flaky.set_down(true);            // everything fails
//! flaky.set_reply_delay(d);        // commands run, replies arrive late
//! ```

use async_trait::async_trait;
use state_service::store::{BackendError, KeyValueStore};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FaultState {
    down: AtomicBool,
    fail_next: AtomicU32,
    delay_ms: AtomicU64,
    reply_delay_ms: AtomicU64,
    failing_ops: Mutex<HashSet<&'static str>>,
    calls: AtomicU64,
    failures: AtomicU64,
}

/// Backend wrapper with switchable faults. Clones share state.
#[derive(Clone)]
pub struct FlakyStore {
    inner: Arc<dyn KeyValueStore>,
    faults: Arc<FaultState>,
}

impl FlakyStore {
    pub fn new(inner: impl KeyValueStore + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            faults: Arc::new(FaultState::default()),
        }
    }

    /// Fail every call while `down` is true.
    pub fn set_down(&self, down: bool) {
        self.faults.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `count` calls, whatever they are.
    pub fn fail_next(&self, count: u32) {
        self.faults.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every call to `operation` (trait method name, e.g. `"set_if_exists"`).
    pub fn fail_operation(&self, operation: &'static str) {
        self.faults.failing_ops.lock().unwrap().insert(operation);
    }

    /// Delay every call before it runs.
    pub fn set_delay(&self, delay: Duration) {
        self.faults
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Run every call, then hold its reply back.
    ///
    /// Models a command that completed on the server but whose reply
    /// outlived the caller's timeout.
    pub fn set_reply_delay(&self, delay: Duration) {
        self.faults
            .reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Remove all faults. Counters are kept.
    pub fn heal(&self) {
        self.set_down(false);
        self.fail_next(0);
        self.set_delay(Duration::ZERO);
        self.set_reply_delay(Duration::ZERO);
        self.faults.failing_ops.lock().unwrap().clear();
    }

    /// Calls received, including failed ones.
    pub fn calls(&self) -> u64 {
        self.faults.calls.load(Ordering::SeqCst)
    }

    /// Calls that were made to fail.
    pub fn failures(&self) -> u64 {
        self.faults.failures.load(Ordering::SeqCst)
    }

    async fn gate(&self, operation: &'static str) -> Result<(), BackendError> {
        self.faults.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.faults.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let consumed_one_shot = self
            .faults
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let targeted = self.faults.failing_ops.lock().unwrap().contains(operation);

        if self.faults.down.load(Ordering::SeqCst) || consumed_one_shot || targeted {
            self.faults.failures.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::Unavailable(format!(
                "injected fault on {operation}"
            )));
        }
        Ok(())
    }

    async fn reply<T>(&self, outcome: T) -> T {
        let delay = self.faults.reply_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        outcome
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.gate("get").await?;
        let outcome = self.inner.get(key).await;
        self.reply(outcome).await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        self.gate("set").await?;
        let outcome = self.inner.set(key, value, ttl).await;
        self.reply(outcome).await
    }

    async fn set_if_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        self.gate("set_if_exists").await?;
        let outcome = self.inner.set_if_exists(key, value, ttl).await;
        self.reply(outcome).await
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.gate("delete").await?;
        let outcome = self.inner.delete(key).await;
        self.reply(outcome).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.gate("exists").await?;
        let outcome = self.inner.exists(key).await;
        self.reply(outcome).await
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, BackendError> {
        self.gate("incr").await?;
        let outcome = self.inner.incr(key, ttl).await;
        self.reply(outcome).await
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), BackendError> {
        self.gate("sorted_add").await?;
        let outcome = self.inner.sorted_add(key, member, score).await;
        self.reply(outcome).await
    }

    async fn sorted_pop_min(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<(String, f64)>, BackendError> {
        self.gate("sorted_pop_min").await?;
        let outcome = self.inner.sorted_pop_min(key, count).await;
        self.reply(outcome).await
    }

    async fn sorted_range(&self, key: &str, count: usize) -> Result<Vec<String>, BackendError> {
        self.gate("sorted_range").await?;
        let outcome = self.inner.sorted_range(key, count).await;
        self.reply(outcome).await
    }

    async fn sorted_len(&self, key: &str) -> Result<u64, BackendError> {
        self.gate("sorted_len").await?;
        let outcome = self.inner.sorted_len(key).await;
        self.reply(outcome).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BackendError> {
        self.gate("set_add").await?;
        let outcome = self.inner.set_add(key, member).await;
        self.reply(outcome).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BackendError> {
        self.gate("set_remove").await?;
        let outcome = self.inner.set_remove(key, member).await;
        self.reply(outcome).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        self.gate("set_members").await?;
        let outcome = self.inner.set_members(key).await;
        self.reply(outcome).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        self.gate("scan_prefix").await?;
        let outcome = self.inner.scan_prefix(prefix).await;
        self.reply(outcome).await
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.gate("ping").await?;
        let outcome = self.inner.ping().await;
        self.reply(outcome).await
    }
}
