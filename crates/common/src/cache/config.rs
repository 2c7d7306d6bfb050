//! Cache configuration types and builder patterns
//!
//! The cache is always LRU-ordered; configuration decides how large it may
//! grow and how long entries live.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Pushed out by the size bound (least recently used first)
    SizeLimit,
    /// Lived past its time-to-live
    TtlExpired,
    /// Removed explicitly by a caller (invalidation, clear)
    Manual,
}

impl EvictionReason {
    pub const ALL: [Self; 3] = [Self::SizeLimit, Self::TtlExpired, Self::Manual];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SizeLimit => "size_limit",
            Self::TtlExpired => "ttl_expired",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for cache behavior
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheConfig {
    /// Maximum number of entries (None = unlimited)
    pub max_size: Option<usize>,

    /// Time-to-live for entries (None = no expiration)
    pub ttl: Option<Duration>,
}

impl CacheConfig {
    /// Create a new configuration builder
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Quick preset for a TTL-only cache
    pub fn ttl(duration: Duration) -> Self {
        Self { max_size: None, ttl: Some(duration) }
    }

    /// Quick preset for a size-bounded LRU cache
    pub fn lru(max_size: usize) -> Self {
        Self { max_size: Some(max_size), ttl: None }
    }

    /// Combined TTL + LRU cache
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    ///
    /// use sheetgate_common::cache::CacheConfig;
    ///
    /// let config = CacheConfig::ttl_lru(Duration::from_secs(60), 1000);
    /// assert_eq!(config.max_size, Some(1000));
    /// ```
    pub fn ttl_lru(ttl: Duration, max_size: usize) -> Self {
        Self { max_size: Some(max_size), ttl: Some(ttl) }
    }
}

/// Builder for CacheConfig with fluent API
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Set the maximum number of entries
    pub fn max_size(mut self, size: usize) -> Self {
        self.config.max_size = Some(size);
        self
    }

    /// Set the time-to-live for entries
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = Some(ttl);
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}
