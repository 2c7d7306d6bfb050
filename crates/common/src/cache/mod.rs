//! Generic TTL + LRU cache with eviction reasons
//!
//! # Features
//!
//! - **Thread-safe**: `parking_lot::Mutex` around an `lru::LruCache`
//! - **Generic**: Works with any `K: Eq + Hash + Clone` and `V: Clone`
//! - **TTL support**: expiry driven by an injectable [`Clock`]
//! - **Eviction reasons**: every removal is tagged `size_limit`,
//!   `ttl_expired` or `manual`, counted in [`CacheStats`] and forwarded to an
//!   optional listener
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use sheetgate_common::cache::{Cache, CacheConfig, EvictionReason};
//!
//! let cache: Cache<String, Vec<u8>> =
//!     Cache::new(CacheConfig::ttl_lru(Duration::from_secs(300), 1000));
//! cache.insert("range:A1:B2".to_string(), vec![1, 2, 3]);
//! cache.invalidate(&"range:A1:B2".to_string());
//! assert_eq!(cache.stats().evictions(EvictionReason::Manual), 1);
//! ```
//!
//! [`Clock`]: crate::resilience::Clock

mod config;
mod core;
mod stats;

// Re-export public API
pub use core::{Cache, EvictionListener};

pub use config::{CacheConfig, CacheConfigBuilder, EvictionReason};
pub use stats::CacheStats;
