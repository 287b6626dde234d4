//! TTL key/value cache.
//!
//! Entries are never returned past their expiry: an expired entry is a miss
//! and is dropped on the lookup that finds it. There is no size-based
//! eviction, the key space is small and bounded by its callers.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Longest lifetime an entry can be given; longer TTLs are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Thread-safe TTL cache keyed by string.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Live value for `key`, or `None` when absent or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite, restarting the TTL clock.
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl.min(MAX_TTL))
            .or_else(|| now.checked_add(MAX_TTL))
            .unwrap_or(now);
        let entry = CacheEntry { value, expires_at };
        self.entries.lock().insert(key.to_string(), entry);
    }

    /// Remove `key`. Returns whether an entry (live or not) was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Remaining lifetime of a live entry.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now)
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_hit_then_expire() {
        let cache = TtlCache::new();
        cache.set("pc", 1u32, Duration::from_secs(300));
        assert_eq!(cache.get("pc"), Some(1));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get("pc"), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("pc"), None);
        // Lazily purged on the miss
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_resets_ttl() {
        let cache = TtlCache::new();
        cache.set("k", "a".to_string(), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("k", "b".to_string(), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_ttl_is_clamped() {
        let cache = TtlCache::new();
        cache.set("pc", 7u32, Duration::MAX);
        assert_eq!(cache.get("pc"), Some(7));
        assert_eq!(cache.ttl_remaining("pc"), Some(MAX_TTL));
    }

    #[test]
    fn test_missing_key() {
        let cache: TtlCache<u8> = TtlCache::new();
        assert_eq!(cache.get("nope"), None);
        assert!(!cache.invalidate("nope"));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = TtlCache::new();
        cache.set("a", 1, Duration::from_secs(60));
        cache.set("b", 2, Duration::from_secs(60));

        assert!(cache.invalidate("a"));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = TtlCache::new();
        cache.set("short", 1, Duration::from_secs(1));
        cache.set("long", 2, Duration::from_secs(100));
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.ttl_remaining("long"), Some(Duration::from_secs(95)));
    }

    #[test]
    fn test_concurrent_writers() {
        let cache = Arc::new(TtlCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        cache.set(&format!("{}:{}", i, j % 10), j, Duration::from_secs(60));
                        let _ = cache.get(&format!("{}:{}", i, j % 10));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 80);
    }
}
