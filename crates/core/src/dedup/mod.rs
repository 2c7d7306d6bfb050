//! Request deduplication and read result caching

pub mod deduplicator;
pub mod result_cache;

pub use deduplicator::{DedupKey, DedupStats, RequestDeduplicator};
pub use result_cache::{CacheKey, CacheTicket, ResultCache};
