//! TTL cache abstraction
//!
//! Small concurrent map with per-entry expiry, shared by the version cache
//! on the callback critical path and the secondary metadata caches (style
//! info, provider balance). Entries expire against a monotonic clock; a
//! fixed-interval sweeper evicts what `get` has not already dropped.
//!
//! Sizing assumption: entry count is bounded by concurrently in-flight
//! generation jobs, so the O(n) sweep is fine. Single-instance deployment
//! only; a multi-instance topology needs an external KV store instead.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent TTL map: `get`/`set`/`delete`/`clear`/`cleanup`.
///
/// Cloning shares the underlying map.
pub struct TtlCache<K, V> {
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
    default_ttl: Duration,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            default_ttl: self.default_ttl,
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache whose `set` entries live for `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
        }
    }

    /// Look up a live entry. Expired entries are removed on access.
    pub async fn get(&self, key: &K) -> Option<V> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone());
                }
                Some(_) => {} // expired, fall through to remove
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        // Re-check under the write lock: a concurrent set may have refreshed it
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert with the default TTL.
    pub async fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    /// Insert with an explicit TTL.
    pub async fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remove an entry regardless of expiry.
    pub async fn delete(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Evict expired entries; returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Live + expired-but-unswept entry count.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Spawn a background sweeper that calls [`cleanup`](Self::cleanup)
    /// every `interval`. The task runs for the life of the process.
    pub fn spawn_sweeper(&self, interval: Duration, label: &'static str) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it so startup stays quiet
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = cache.cleanup().await;
                if evicted > 0 {
                    debug!(cache = label, evicted, "TTL cache sweep");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.set("a".to_string(), 1).await;

        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        assert_eq!(cache.get(&"b".to_string()).await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_gone() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(10));
        cache.set("a".to_string(), 1).await;

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.get(&"a".to_string()).await, None);
        // get() removed the expired entry as a side effect
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_set_refreshes_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(40));
        cache.set("a".to_string(), 1).await;

        tokio::time::sleep(Duration::from_millis(25)).await;
        cache.set("a".to_string(), 2).await;
        tokio::time::sleep(Duration::from_millis(25)).await;

        // 50ms after the first set, but only 25ms after the refresh
        assert_eq!(cache.get(&"a".to_string()).await, Some(2));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.set("a".to_string(), 1).await;
        cache.set("b".to_string(), 2).await;

        cache.delete(&"a".to_string()).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert_eq!(cache.get(&"b".to_string()).await, Some(2));

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_only_expired() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache
            .set_with_ttl("short".to_string(), 1, Duration::from_millis(10))
            .await;
        cache.set("long".to_string(), 2).await;

        tokio::time::sleep(Duration::from_millis(30)).await;

        let evicted = cache.cleanup().await;
        assert_eq!(evicted, 1);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(&"long".to_string()).await, Some(2));
    }

    #[tokio::test]
    async fn test_clone_shares_entries() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        let other = cache.clone();

        cache.set("a".to_string(), 1).await;
        assert_eq!(other.get(&"a".to_string()).await, Some(1));
    }
}
