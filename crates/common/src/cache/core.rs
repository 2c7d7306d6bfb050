//! Core cache implementation: LRU ordering, TTL expiry, eviction reasons
//!
//! Storage is an [`lru::LruCache`] behind a `parking_lot` mutex. Every entry
//! that leaves the cache other than by being overwritten is attributed an
//! [`EvictionReason`], counted, and handed to the optional eviction
//! listener. Listeners run after the lock is released.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::config::{CacheConfig, EvictionReason};
use super::stats::{CacheStats, MetricsCollector};
use crate::resilience::{Clock, SystemClock};

/// Callback invoked for every evicted key
pub type EvictionListener<K> = Arc<dyn Fn(&K, EvictionReason) + Send + Sync>;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

enum Lookup<V> {
    Hit(V),
    Miss,
    Expired,
}

/// Generic thread-safe cache with LRU eviction and TTL expiry
///
/// # Type Parameters
/// - `K`: Key type (must be `Eq + Hash + Clone`)
/// - `V`: Value type (must be `Clone`)
/// - `C`: Clock type for time-based operations (defaults to `SystemClock`)
///
/// # Example
/// ```
/// use sheetgate_common::cache::{Cache, CacheConfig};
///
/// let cache: Cache<String, i32> = Cache::new(CacheConfig::lru(100));
/// cache.insert("key".to_string(), 42);
/// assert_eq!(cache.get(&"key".to_string()), Some(42));
/// ```
pub struct Cache<K, V, C = SystemClock>
where
    K: Eq + Hash + Clone,
    V: Clone,
    C: Clock,
{
    storage: Arc<Mutex<LruCache<K, CacheEntry<V>>>>,
    config: CacheConfig,
    metrics: MetricsCollector,
    listener: Option<EvictionListener<K>>,
    clock: C,
}

impl<K, V> Cache<K, V, SystemClock>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a new cache with the given configuration using system clock
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<K, V, C> Cache<K, V, C>
where
    K: Eq + Hash + Clone,
    V: Clone,
    C: Clock,
{
    /// Create a new cache with a custom clock (useful for testing)
    pub fn with_clock(config: CacheConfig, clock: C) -> Self {
        let storage = match config.max_size.and_then(std::num::NonZeroUsize::new) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            storage: Arc::new(Mutex::new(storage)),
            config,
            metrics: MetricsCollector::default(),
            listener: None,
            clock,
        }
    }

    /// Register a callback that observes every eviction
    #[must_use]
    pub fn with_eviction_listener(mut self, listener: EvictionListener<K>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Insert a value, replacing any previous value for the key
    ///
    /// When the cache is full, expired entries are dropped first; only if
    /// none were expired is the least recently used entry evicted.
    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        let entry = CacheEntry { value, expires_at: self.config.ttl.map(|ttl| now + ttl) };
        let mut evicted = Vec::new();

        {
            let mut storage = self.storage.lock();
            if !storage.contains(&key) && storage.len() >= storage.cap().get() {
                Self::drain_expired(&mut storage, now, &mut evicted);
            }
            if let Some((old_key, _)) = storage.push(key.clone(), entry) {
                if old_key != key {
                    evicted.push((old_key, EvictionReason::SizeLimit));
                }
            }
        }

        self.metrics.record_insert();
        self.notify(evicted);
    }

    /// Get a value from the cache, promoting it to most recently used
    ///
    /// Returns `None` if the key doesn't exist or if the entry has expired;
    /// an expired entry is removed on the way out.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let lookup = {
            let mut storage = self.storage.lock();
            let lookup = match storage.get(key) {
                None => Lookup::Miss,
                Some(entry) if entry.is_expired(now) => Lookup::Expired,
                Some(entry) => Lookup::Hit(entry.value.clone()),
            };
            if matches!(lookup, Lookup::Expired) {
                storage.pop(key);
            }
            lookup
        };

        match lookup {
            Lookup::Hit(value) => {
                self.metrics.record_hit();
                Some(value)
            }
            Lookup::Miss => {
                self.metrics.record_miss();
                None
            }
            Lookup::Expired => {
                self.metrics.record_miss();
                self.notify(vec![(key.clone(), EvictionReason::TtlExpired)]);
                None
            }
        }
    }

    /// Check for a live entry without touching LRU order or statistics
    pub fn contains(&self, key: &K) -> bool {
        let now = self.clock.now();
        self.storage.lock().peek(key).is_some_and(|entry| !entry.is_expired(now))
    }

    /// Remove one entry. Returns `true` if it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.storage.lock().pop(key).is_some();
        if removed {
            self.notify(vec![(key.clone(), EvictionReason::Manual)]);
        }
        removed
    }

    /// Remove every entry matching the predicate. Returns the count removed.
    pub fn invalidate_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K, &V) -> bool,
    {
        let evicted: Vec<(K, EvictionReason)> = {
            let mut storage = self.storage.lock();
            let keys: Vec<K> = storage
                .iter()
                .filter(|(key, entry)| predicate(key, &entry.value))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                storage.pop(key);
            }
            keys.into_iter().map(|key| (key, EvictionReason::Manual)).collect()
        };

        let count = evicted.len();
        self.notify(evicted);
        count
    }

    /// Remove all entries. Returns the count removed.
    pub fn clear(&self) -> usize {
        self.invalidate_where(|_, _| true)
    }

    /// Remove expired entries. Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> usize {
        if self.config.ttl.is_none() {
            return 0;
        }
        let now = self.clock.now();
        let mut evicted = Vec::new();
        Self::drain_expired(&mut self.storage.lock(), now, &mut evicted);

        let count = evicted.len();
        self.notify(evicted);
        count
    }

    /// Get the current number of entries (expired entries not yet swept
    /// included)
    pub fn len(&self) -> usize {
        self.storage.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot(self.len(), self.config.max_size)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn drain_expired(
        storage: &mut LruCache<K, CacheEntry<V>>,
        now: Instant,
        evicted: &mut Vec<(K, EvictionReason)>,
    ) {
        let expired: Vec<K> = storage
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            storage.pop(&key);
            evicted.push((key, EvictionReason::TtlExpired));
        }
    }

    fn notify(&self, evicted: Vec<(K, EvictionReason)>) {
        for (key, reason) in evicted {
            self.metrics.record_eviction(reason);
            debug!(reason = %reason, "cache entry evicted");
            if let Some(listener) = &self.listener {
                listener(&key, reason);
            }
        }
    }
}

impl<K, V, C> Clone for Cache<K, V, C>
where
    K: Eq + Hash + Clone,
    V: Clone,
    C: Clock + Clone,
{
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            listener: self.listener.clone(),
            clock: self.clock.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for cache::core.
    use std::time::Duration;

    use parking_lot::Mutex as TestMutex;

    use super::*;
    use crate::resilience::MockClock;

    fn recording_cache(
        config: CacheConfig,
        clock: MockClock,
    ) -> (Cache<String, i32, MockClock>, Arc<TestMutex<Vec<(String, EvictionReason)>>>) {
        let events = Arc::new(TestMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let cache = Cache::with_clock(config, clock).with_eviction_listener(Arc::new(
            move |key: &String, reason| sink.lock().push((key.clone(), reason)),
        ));
        (cache, events)
    }

    /// Validates basic insert, get, and replacement.
    ///
    /// Assertions:
    /// - Confirms stored values are returned and missing keys are `None`.
    /// - Confirms replacing a key keeps a single entry and records no
    ///   eviction.
    #[test]
    fn test_cache_insert_get_replace() {
        let cache: Cache<String, i32> = Cache::new(CacheConfig::lru(10));

        cache.insert("key".to_string(), 42);
        assert_eq!(cache.get(&"key".to_string()), Some(42));
        assert_eq!(cache.get(&"other".to_string()), None);

        cache.insert("key".to_string(), 84);
        assert_eq!(cache.get(&"key".to_string()), Some(84));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().total_evictions(), 0);
    }

    /// Validates LRU eviction with the `size_limit` reason.
    ///
    /// Assertions:
    /// - Confirms the least recently used key is evicted, not the oldest.
    /// - Confirms the listener saw a `SizeLimit` eviction.
    #[test]
    fn test_lru_eviction_reason() {
        let (cache, events) = recording_cache(CacheConfig::lru(2), MockClock::new());

        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        let _ = cache.get(&"a".to_string());
        cache.insert("c".to_string(), 3);

        assert!(cache.contains(&"a".to_string()));
        assert!(!cache.contains(&"b".to_string()));
        assert_eq!(*events.lock(), vec![("b".to_string(), EvictionReason::SizeLimit)]);
        assert_eq!(cache.stats().evictions(EvictionReason::SizeLimit), 1);
    }

    /// Validates TTL expiry on read with the `ttl_expired` reason.
    ///
    /// Assertions:
    /// - Confirms the entry is served before the TTL and missed after it.
    /// - Confirms the miss is attributed to `TtlExpired`.
    #[test]
    fn test_ttl_expiry_on_get() {
        let clock = MockClock::new();
        let (cache, events) =
            recording_cache(CacheConfig::ttl_lru(Duration::from_secs(60), 10), clock.clone());

        cache.insert("k".to_string(), 7);
        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get(&"k".to_string()), Some(7));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&"k".to_string()), None);
        assert_eq!(*events.lock(), vec![("k".to_string(), EvictionReason::TtlExpired)]);
        assert!(cache.is_empty());
    }

    /// Validates that a full cache drops expired entries before live ones.
    ///
    /// Assertions:
    /// - Confirms the expired entry is evicted as `TtlExpired`.
    /// - Confirms the live entry survives.
    #[test]
    fn test_full_cache_prefers_expired_entries() {
        let clock = MockClock::new();
        let (cache, events) =
            recording_cache(CacheConfig::ttl_lru(Duration::from_secs(10), 2), clock.clone());

        cache.insert("old".to_string(), 1);
        clock.advance(Duration::from_secs(8));
        cache.insert("live".to_string(), 2);
        let _ = cache.get(&"old".to_string());
        clock.advance(Duration::from_secs(3));
        cache.insert("new".to_string(), 3);

        assert!(cache.contains(&"live".to_string()));
        assert!(cache.contains(&"new".to_string()));
        assert_eq!(*events.lock(), vec![("old".to_string(), EvictionReason::TtlExpired)]);
    }

    /// Validates manual invalidation by key and by predicate.
    ///
    /// Assertions:
    /// - Confirms only matching entries are removed.
    /// - Confirms every removal is counted as `Manual`.
    #[test]
    fn test_manual_invalidation() {
        let (cache, _events) = recording_cache(CacheConfig::lru(10), MockClock::new());
        cache.insert("sheet-1:a".to_string(), 1);
        cache.insert("sheet-1:b".to_string(), 2);
        cache.insert("sheet-2:a".to_string(), 3);

        assert!(cache.invalidate(&"sheet-2:a".to_string()));
        assert!(!cache.invalidate(&"sheet-2:a".to_string()));
        assert_eq!(cache.invalidate_where(|key, _| key.starts_with("sheet-1:")), 2);

        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions(EvictionReason::Manual), 3);
    }

    /// Validates the periodic sweep of expired entries.
    ///
    /// Assertions:
    /// - Confirms only expired entries are removed.
    #[test]
    fn test_cleanup_expired() {
        let clock = MockClock::new();
        let cache: Cache<u32, u32, MockClock> =
            Cache::with_clock(CacheConfig::ttl(Duration::from_secs(5)), clock.clone());
        cache.insert(1, 1);
        clock.advance(Duration::from_secs(3));
        cache.insert(2, 2);
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions(EvictionReason::TtlExpired), 1);
    }

    /// Validates hit/miss accounting.
    ///
    /// Assertions:
    /// - Confirms one hit and two misses are recorded.
    #[test]
    fn test_hit_miss_stats() {
        let cache: Cache<&'static str, i32> = Cache::new(CacheConfig::lru(4));
        cache.insert("x", 1);
        let _ = cache.get(&"x");
        let _ = cache.get(&"y");
        let _ = cache.get(&"z");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.inserts), (1, 2, 1));
        assert_eq!(stats.max_size, Some(4));
    }
}
