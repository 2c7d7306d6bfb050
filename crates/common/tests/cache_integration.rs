//! Integration tests for the cache module
//!
//! Covers concurrent access and eviction attribution across threads.

#![cfg(feature = "runtime")]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sheetgate_common::cache::{Cache, CacheConfig, EvictionReason};
use sheetgate_common::resilience::MockClock;

/// Validates that a bounded cache stays bounded under concurrent inserts and
/// that every overflow is attributed to the size limit.
///
/// # Test Steps
/// 1. Spawn 8 threads inserting 50 distinct keys each into a 100-entry cache
/// 2. Count evictions through the listener
/// 3. Confirm size and eviction totals add up
#[test]
fn test_concurrent_inserts_respect_bound() {
    let observed = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&observed);
    let cache: Arc<Cache<String, usize>> = Arc::new(
        Cache::new(CacheConfig::lru(100)).with_eviction_listener(Arc::new(move |_, reason| {
            assert_eq!(reason, EvictionReason::SizeLimit);
            sink.fetch_add(1, Ordering::SeqCst);
        })),
    );

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..50 {
                    cache.insert(format!("{worker}-{i}"), i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let stats = cache.stats();
    assert_eq!(cache.len(), 100);
    assert_eq!(stats.evictions(EvictionReason::SizeLimit), 300);
    assert_eq!(observed.load(Ordering::SeqCst), 300);
}

/// Validates a mixed workload where TTL, LRU and manual removal all occur.
///
/// # Test Steps
/// 1. Fill a 3-entry TTL cache
/// 2. Invalidate one entry, let another expire, overflow with new inserts
/// 3. Confirm each reason is counted once
#[test]
fn test_mixed_eviction_reasons() {
    let clock = MockClock::new();
    let cache: Cache<&'static str, u8, MockClock> =
        Cache::with_clock(CacheConfig::ttl_lru(Duration::from_secs(30), 3), clock.clone());

    cache.insert("a", 1);
    clock.advance(Duration::from_secs(20));
    cache.insert("b", 2);
    cache.insert("c", 3);
    assert!(cache.invalidate(&"c"));

    clock.advance(Duration::from_secs(15));
    assert_eq!(cache.get(&"a"), None);

    cache.insert("d", 4);
    cache.insert("e", 5);
    let _ = cache.get(&"b");
    cache.insert("f", 6);

    let stats = cache.stats();
    assert_eq!(stats.evictions(EvictionReason::Manual), 1);
    assert_eq!(stats.evictions(EvictionReason::TtlExpired), 1);
    assert_eq!(stats.evictions(EvictionReason::SizeLimit), 1);
    assert!(!cache.contains(&"d"));
    assert!(cache.contains(&"b"));
}
