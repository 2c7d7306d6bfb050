//! Cache statistics and metrics tracking
//!
//! This module provides types for tracking cache performance metrics
//! including hit rates and eviction counts broken down by reason.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::config::EvictionReason;

/// Statistics for cache performance monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Current number of entries
    pub size: usize,

    /// Maximum allowed entries (None = unlimited)
    pub max_size: Option<usize>,

    /// Total number of successful get operations
    pub hits: u64,

    /// Total number of failed get operations (key not found or expired)
    pub misses: u64,

    /// Total number of insert operations
    pub inserts: u64,

    /// Entries pushed out by the size bound
    pub evicted_size_limit: u64,

    /// Entries removed because their TTL elapsed
    pub evicted_ttl_expired: u64,

    /// Entries removed by explicit invalidation
    pub evicted_manual: u64,
}

impl CacheStats {
    /// Calculate hit rate (hits / total accesses)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total number of access operations (hits + misses)
    pub fn total_accesses(&self) -> u64 {
        self.hits + self.misses
    }

    /// Evictions recorded for one reason
    pub fn evictions(&self, reason: EvictionReason) -> u64 {
        match reason {
            EvictionReason::SizeLimit => self.evicted_size_limit,
            EvictionReason::TtlExpired => self.evicted_ttl_expired,
            EvictionReason::Manual => self.evicted_manual,
        }
    }

    /// Evictions across all reasons
    pub fn total_evictions(&self) -> u64 {
        self.evicted_size_limit + self.evicted_ttl_expired + self.evicted_manual
    }
}

/// Thread-safe metrics collector for cache operations
///
/// Atomic counters so that recording never contends with the cache lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct MetricsCollector {
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    inserts: Arc<AtomicU64>,
    size_limit: Arc<AtomicU64>,
    ttl_expired: Arc<AtomicU64>,
    manual: Arc<AtomicU64>,
}

impl MetricsCollector {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, reason: EvictionReason) {
        let counter = match reason {
            EvictionReason::SizeLimit => &self.size_limit,
            EvictionReason::TtlExpired => &self.ttl_expired,
            EvictionReason::Manual => &self.manual,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub(crate) fn snapshot(&self, size: usize, max_size: Option<usize>) -> CacheStats {
        CacheStats {
            size,
            max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evicted_size_limit: self.size_limit.load(Ordering::Relaxed),
            evicted_ttl_expired: self.ttl_expired.load(Ordering::Relaxed),
            evicted_manual: self.manual.load(Ordering::Relaxed),
        }
    }
}
