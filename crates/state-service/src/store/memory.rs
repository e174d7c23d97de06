//! In-memory [`KeyValueStore`] backend.
//!
//! Process-local and non-durable. Mirrors the Redis semantics the
//! orchestration layer depends on (TTL replacement on `SET`, TTL preserved
//! on `INCR`, empty collections removed, `WRONGTYPE` on type mismatch) so
//! components behave identically against either backend.
//!
//! Expiry is evaluated lazily against the injected [`Clock`], which lets
//! tests move time with [`ManualClock`](crate::clock::ManualClock).

use super::{BackendError, KeyValueStore};
use crate::clock::{add_saturating, SharedClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    /// Kept ordered by (score, member), like a Redis ZSET.
    Sorted(Vec<(f64, String)>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

fn wrong_type(key: &str) -> BackendError {
    BackendError::Rejected(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

/// In-memory store. Cheaply cloneable; clones share state.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // The map is never left half-updated, so a poisoned lock is still usable
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| add_saturating(self.clock.now(), ttl))
    }

    /// Drop `key` if it has expired.
    fn purge(map: &mut HashMap<String, Entry>, key: &str, now: DateTime<Utc>) {
        if map.get(key).is_some_and(|entry| !entry.is_live(now)) {
            map.remove(key);
        }
    }

    /// Return the live entry for `key`, if any.
    fn live<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Entry> {
        Self::purge(map, key, now);
        map.get_mut(key)
    }

    /// Remaining TTL of a live key. `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut map = self.lock();
        let entry = Self::live(&mut map, key, now)?;
        entry
            .expires_at
            .and_then(|at| (at - now).to_std().ok())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut map = self.lock();
        map.retain(|_, entry| entry.is_live(now));
        map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let expires_at = self.expiry(ttl);
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut map = self.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(false),
            Some(entry) => {
                *entry = Entry {
                    value: Value::Str(value.to_string()),
                    expires_at,
                };
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        Ok(map.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        Ok(Self::live(&mut map, key, now).is_some())
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, BackendError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut map = self.lock();
        if let Some(entry) = Self::live(&mut map, key, now) {
            let Value::Str(raw) = &entry.value else {
                return Err(wrong_type(key));
            };
            let current: i64 = raw
                .parse()
                .map_err(|_| BackendError::Rejected("value is not an integer".to_string()))?;
            let next = current
                .checked_add(1)
                .ok_or_else(|| BackendError::Rejected("increment overflow".to_string()))?;
            entry.value = Value::Str(next.to_string());
            return Ok(next);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str("1".to_string()),
                expires_at,
            },
        );
        Ok(1)
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        Self::purge(&mut map, key, now);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Sorted(Vec::new()),
            expires_at: None,
        });
        let Value::Sorted(members) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        members.retain(|(_, m)| m != member);
        let position = members.partition_point(|(s, m)| {
            s.total_cmp(&score)
                .then_with(|| m.as_str().cmp(member))
                .is_lt()
        });
        members.insert(position, (score, member.to_string()));
        Ok(())
    }

    async fn sorted_pop_min(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<(String, f64)>, BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        let Some(entry) = Self::live(&mut map, key, now) else {
            return Ok(Vec::new());
        };
        let Value::Sorted(members) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let take = count.min(members.len());
        let popped: Vec<(String, f64)> = members
            .drain(..take)
            .map(|(score, member)| (member, score))
            .collect();
        if members.is_empty() {
            map.remove(key);
        }
        Ok(popped)
    }

    async fn sorted_range(&self, key: &str, count: usize) -> Result<Vec<String>, BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => Ok(members.iter().take(count).map(|(_, m)| m.clone()).collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sorted_len(&self, key: &str) -> Result<u64, BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(0),
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => Ok(members.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        Self::purge(&mut map, key, now);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        let Value::Set(members) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        members.insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        let Some(entry) = Self::live(&mut map, key, now) else {
            return Ok(());
        };
        let Value::Set(members) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        members.remove(member);
        if members.is_empty() {
            map.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        match Self::live(&mut map, key, now) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let now = self.clock.now();
        let mut map = self.lock();
        map.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        (MemoryStore::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_set_get_and_ttl_expiry() {
        let (store, clock) = store();
        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_if_exists_does_not_create() {
        let (store, _clock) = store();

        assert!(!store.set_if_exists("k", "v", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "old", None).await.unwrap();
        assert!(store
            .set_if_exists("k", "new", Some(Duration::from_secs(5)))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_set_if_exists_after_expiry_is_a_miss() {
        let (store, clock) = store();
        store
            .set("k", "v", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        assert!(!store.set_if_exists("k", "v2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_applies_ttl_only_on_create() {
        let (store, clock) = store();
        let ttl = Some(Duration::from_secs(60));

        assert_eq!(store.incr("c", ttl).await.unwrap(), 1);
        clock.advance(Duration::from_secs(30));
        assert_eq!(store.incr("c", ttl).await.unwrap(), 2);
        // TTL still counts from creation
        assert_eq!(store.ttl("c"), Some(Duration::from_secs(30)));

        clock.advance(Duration::from_secs(30));
        assert_eq!(store.incr("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_on_non_integer_is_rejected() {
        let (store, _clock) = store();
        store.set("c", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr("c", None).await,
            Err(BackendError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_sorted_set_orders_by_score_then_member() {
        let (store, _clock) = store();
        store.sorted_add("z", "b", 2.0).await.unwrap();
        store.sorted_add("z", "a", 2.0).await.unwrap();
        store.sorted_add("z", "c", 1.0).await.unwrap();

        assert_eq!(store.sorted_len("z").await.unwrap(), 3);
        assert_eq!(store.sorted_range("z", 10).await.unwrap(), vec!["c", "a", "b"]);

        let popped = store.sorted_pop_min("z", 2).await.unwrap();
        assert_eq!(
            popped,
            vec![("c".to_string(), 1.0), ("a".to_string(), 2.0)]
        );
        assert_eq!(store.sorted_len("z").await.unwrap(), 1);

        store.sorted_pop_min("z", 5).await.unwrap();
        assert!(!store.exists("z").await.unwrap());
    }

    #[tokio::test]
    async fn test_sorted_add_rescores_existing_member() {
        let (store, _clock) = store();
        store.sorted_add("z", "a", 5.0).await.unwrap();
        store.sorted_add("z", "b", 3.0).await.unwrap();
        store.sorted_add("z", "a", 1.0).await.unwrap();

        assert_eq!(store.sorted_range("z", 10).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let (store, _clock) = store();
        store.set("s", "plain", None).await.unwrap();
        assert!(matches!(
            store.sorted_add("s", "m", 1.0).await,
            Err(BackendError::Rejected(_))
        ));
        store.set_add("idx", "m").await.unwrap();
        assert!(matches!(
            store.get("idx").await,
            Err(BackendError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_set_members_and_removal() {
        let (store, _clock) = store();
        store.set_add("idx", "b").await.unwrap();
        store.set_add("idx", "a").await.unwrap();
        store.set_add("idx", "a").await.unwrap();

        assert_eq!(store.set_members("idx").await.unwrap(), vec!["a", "b"]);

        store.set_remove("idx", "a").await.unwrap();
        store.set_remove("idx", "b").await.unwrap();
        assert!(!store.exists("idx").await.unwrap());
        // Removing from an absent set is fine
        store.set_remove("idx", "b").await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_prefix_skips_expired() {
        let (store, clock) = store();
        store
            .set("cache:a", "1", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set("cache:b", "1", None).await.unwrap();
        store.set("session:x", "1", None).await.unwrap();

        assert_eq!(
            store.scan_prefix("cache:").await.unwrap(),
            vec!["cache:a", "cache:b"]
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.scan_prefix("cache:").await.unwrap(), vec!["cache:b"]);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let (store, _clock) = store();
        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
