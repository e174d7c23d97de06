//! Redis [`KeyValueStore`] backend.
//!
//! # Connection Pattern
//!
//! Uses redis-rs `ConnectionManager`, a multiplexed connection that
//! reconnects on its own after the server goes away. It is cheap to clone and
//! safe to use concurrently: each operation clones it. No locking is needed.
//!
//! Timeouts and retries are NOT handled here. The
//! [`StoreAdapter`](super::StoreAdapter) wraps every call.

use super::lua_scripts;
use super::{BackendError, KeyValueStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError, Script};
use std::time::Duration;
use tracing::{debug, error};

/// Keys fetched per SCAN round trip.
const SCAN_BATCH_SIZE: usize = 200;

/// Map a redis-rs error onto the retry classification.
fn classify(e: RedisError) -> BackendError {
    let transient = e.is_io_error()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || e.is_timeout()
        || matches!(e.kind(), ErrorKind::BusyLoadingError | ErrorKind::TryAgain);

    if transient {
        BackendError::Unavailable(e.to_string())
    } else {
        BackendError::Rejected(e.to_string())
    }
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

fn ttl_millis(ttl: Duration) -> u64 {
    // Redis rejects PX 0; round sub-millisecond TTLs up
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    incr_script: Script,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Unavailable` if the client cannot be opened or
    /// the initial connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, BackendError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Note: Do NOT log redis_url as it may contain credentials
            error!(
                target: "state.store.redis",
                error = %e,
                "Failed to open Redis client"
            );
            BackendError::Unavailable(format!("failed to open Redis client: {e}"))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!(
                target: "state.store.redis",
                error = %e,
                "Failed to connect to Redis"
            );
            BackendError::Unavailable(format!("failed to connect to Redis: {e}"))
        })?;

        debug!(target: "state.store.redis", "Redis connection manager ready");

        Ok(Self {
            connection,
            incr_script: Script::new(lua_scripts::INCR_WITH_EXPIRY),
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await.map_err(classify)?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(classify)?;
        Ok(())
    }

    async fn set_if_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.arg("XX");
        // Nil reply means the key did not exist
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(classify)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.del(key).await.map_err(classify)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(key).await.map_err(classify)?;
        Ok(exists)
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, BackendError> {
        let mut conn = self.connection.clone();
        let ttl_ms = ttl.map_or(0, ttl_millis);
        let count: i64 = self
            .incr_script
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(count)
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let _: () = conn.zadd(key, member, score).await.map_err(classify)?;
        Ok(())
    }

    async fn sorted_pop_min(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<(String, f64)>, BackendError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let count = isize::try_from(count).unwrap_or(isize::MAX);
        let popped: Vec<(String, f64)> = conn.zpopmin(key, count).await.map_err(classify)?;
        Ok(popped)
    }

    async fn sorted_range(&self, key: &str, count: usize) -> Result<Vec<String>, BackendError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let stop = isize::try_from(count - 1).unwrap_or(isize::MAX);
        let members: Vec<String> = conn.zrange(key, 0, stop).await.map_err(classify)?;
        Ok(members)
    }

    async fn sorted_len(&self, key: &str) -> Result<u64, BackendError> {
        let mut conn = self.connection.clone();
        let len: u64 = conn.zcard(key).await.map_err(classify)?;
        Ok(len)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let _: () = conn.sadd(key, member).await.map_err(classify)?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let _: () = conn.srem(key, member).await.map_err(classify)?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn.smembers(key).await.map_err(classify)?;
        Ok(members)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.connection.clone();
        let pattern = escape_glob(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH_SIZE)
                .query_async(&mut conn)
                .await
                .map_err(classify)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
