use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::CacheError;

/// Writes between sweeps of expired entries.
const PRUNE_EVERY: u64 = 1_024;

/// Shared key/value cache holding rate counters and dedup fingerprints.
///
/// `increment` and `set` must be atomic at the cache layer; the engine
/// does no client-side locking around them.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Atomically add one to the integer at `key` (missing keys start at 0)
    /// and return the new value.
    async fn increment(&self, key: &str) -> Result<i64, CacheError>;

    /// Set the time-to-live of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.set(key, value, Some(ttl)).await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, Entry>,
    writes: u64,
}

impl Entries {
    /// Count a write and drop expired keys every `PRUNE_EVERY` writes.
    /// Keys that are never read again would otherwise stay forever.
    fn note_write(&mut self, now: DateTime<Utc>) {
        self.writes += 1;
        if self.writes % PRUNE_EVERY == 0 {
            self.map.retain(|_, entry| entry.is_live(now));
        }
    }
}

/// In-process cache for single-node deployments and tests.
pub struct InMemoryCache {
    entries: Mutex<Entries>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            clock,
        }
    }

    /// Number of stored keys, including expired ones not yet pruned.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.map.is_empty()
    }

    fn deadline(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.map.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let now = self.clock.now();
        let expires_at = ttl.and_then(|ttl| self.deadline(ttl));
        let mut entries = self.entries.lock().await;
        entries.note_write(now);
        entries.map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.note_write(now);
        let entry = entries
            .map
            .entry(key.to_string())
            .and_modify(|entry| {
                if !entry.is_live(now) {
                    entry.value = "0".to_string();
                    entry.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: None,
            });

        let current: i64 = entry.value.parse().map_err(|_| CacheError::NotAnInteger {
            key: key.to_string(),
        })?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let deadline = self.deadline(ttl);
        if let Some(entry) = self.entries.lock().await.map.get_mut(key) {
            entry.expires_at = deadline;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn entries_expire_with_the_clock() {
        let clock = ManualClock::default();
        let cache = InMemoryCache::with_clock(Arc::new(clock.clone()));

        cache.set_with_expiry("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_restarts_after_expiry() {
        let clock = ManualClock::default();
        let cache = InMemoryCache::with_clock(Arc::new(clock.clone()));

        assert_eq!(cache.increment("c").await.unwrap(), 1);
        cache.expire("c", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.increment("c").await.unwrap(), 2);

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(cache.increment("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_keys_are_pruned_on_later_writes() {
        let clock = ManualClock::default();
        let cache = InMemoryCache::with_clock(Arc::new(clock.clone()));

        for i in 0..PRUNE_EVERY {
            cache
                .set_with_expiry(&format!("fp:{i}"), "1", Duration::from_secs(300))
                .await
                .unwrap();
        }
        assert_eq!(cache.len().await, PRUNE_EVERY as usize);

        clock.advance(chrono::Duration::days(1));
        for i in 0..PRUNE_EVERY {
            cache
                .set_with_expiry(&format!("later:{i}"), "1", Duration::from_secs(300))
                .await
                .unwrap();
        }

        // The first batch was never read again but is gone.
        assert!(cache.len().await <= PRUNE_EVERY as usize);
        assert_eq!(cache.get("later:0").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn increment_rejects_non_integers() {
        let cache = InMemoryCache::new();
        cache.set("c", "abc", None).await.unwrap();
        assert!(matches!(
            cache.increment("c").await,
            Err(CacheError::NotAnInteger { .. })
        ));
    }
}
