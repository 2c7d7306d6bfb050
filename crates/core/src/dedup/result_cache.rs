//! Cache of successful read results
//!
//! Keys are scoped by tenant and carry the spreadsheet the read touched, so
//! a write can drop exactly the reads it may have made stale. Each
//! invalidation also records a generation stamp; a read takes a
//! [`CacheTicket`] before it goes upstream and its result is only inserted
//! if no overlapping invalidation happened in between. The stamps tracked
//! per tenant and spreadsheet are bounded.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use sheetgate_common::cache::EvictionListener;
use sheetgate_common::{Cache, CacheConfig, CacheStats};
use sheetgate_domain::{CacheSettings, Fingerprint, Operation};
use tracing::debug;

use crate::SharedClock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant_id: String,
    pub spreadsheet_id: Option<String>,
    pub fingerprint: Fingerprint,
}

impl CacheKey {
    pub fn for_operation(tenant_id: &str, operation: &Operation) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            spreadsheet_id: operation.spreadsheet_id().map(str::to_string),
            fingerprint: operation.fingerprint().clone(),
        }
    }
}

/// Generations observed when a read started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket {
    tenant: u64,
    scope: u64,
}

/// Fewest tenants plus spreadsheets tracked before generations are pruned
const MIN_TRACKED_GENERATIONS: usize = 1_024;

#[derive(Debug)]
struct TenantGenerations {
    /// Stamp of the last write that named no spreadsheet
    all: u64,
    /// Stamp of the last spreadsheet write; guards reads that name none
    unscoped: u64,
    sheets: HashMap<String, u64>,
}

impl TenantGenerations {
    fn new(floor: u64) -> Self {
        Self { all: floor, unscoped: floor, sheets: HashMap::new() }
    }

    fn ticket(&self, spreadsheet_id: Option<&str>, floor: u64) -> CacheTicket {
        let scope = match spreadsheet_id {
            Some(id) => self.sheets.get(id).copied().unwrap_or(floor),
            None => self.unscoped,
        };
        CacheTicket { tenant: self.all, scope }
    }
}

/// Invalidation stamps, bounded by pruning
///
/// Every invalidation takes a fresh stamp. Tenants and spreadsheets with no
/// recorded stamp read as `floor`. A prune forgets everything and raises
/// `floor` past every stamp handed out, so tickets taken before it no longer
/// match and their reads are not inserted.
#[derive(Debug)]
struct Generations {
    stamp: u64,
    floor: u64,
    tenants: HashMap<String, TenantGenerations>,
    tracked: usize,
    bound: usize,
}

impl Generations {
    fn new(bound: usize) -> Self {
        Self { stamp: 0, floor: 0, tenants: HashMap::new(), tracked: 0, bound }
    }

    fn ticket(&self, key: &CacheKey) -> CacheTicket {
        self.tenants.get(&key.tenant_id).map_or(
            CacheTicket { tenant: self.floor, scope: self.floor },
            |tenant| tenant.ticket(key.spreadsheet_id.as_deref(), self.floor),
        )
    }

    fn bump(&mut self, tenant_id: &str, spreadsheet_id: Option<&str>) {
        self.stamp += 1;
        let (stamp, floor) = (self.stamp, self.floor);
        let tenant = self.tenants.entry(tenant_id.to_string()).or_insert_with(|| {
            self.tracked += 1;
            TenantGenerations::new(floor)
        });
        match spreadsheet_id {
            Some(id) => {
                if tenant.sheets.insert(id.to_string(), stamp).is_none() {
                    self.tracked += 1;
                }
                tenant.unscoped = stamp;
            }
            None => tenant.all = stamp,
        }

        if self.tracked > self.bound {
            debug!(tracked = self.tracked, "pruning cache generations");
            self.tenants.clear();
            self.tracked = 0;
            self.stamp += 1;
            self.floor = self.stamp;
        }
    }
}

pub struct ResultCache {
    cache: Cache<CacheKey, Value, SharedClock>,
    generations: Mutex<Generations>,
}

impl ResultCache {
    pub fn new(settings: &CacheSettings, clock: SharedClock) -> Self {
        let config =
            CacheConfig::ttl_lru(Duration::from_millis(settings.ttl_ms), settings.max_entries);
        let bound = settings.max_entries.max(MIN_TRACKED_GENERATIONS);
        Self {
            cache: Cache::with_clock(config, clock),
            generations: Mutex::new(Generations::new(bound)),
        }
    }

    /// Observe every eviction (metrics hook)
    #[must_use]
    pub fn with_eviction_listener(mut self, listener: EvictionListener<CacheKey>) -> Self {
        self.cache = self.cache.with_eviction_listener(listener);
        self
    }

    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let hit = self.cache.get(key);
        debug!(
            tenant_id = %key.tenant_id,
            fingerprint = %key.fingerprint,
            hit = hit.is_some(),
            "result cache lookup"
        );
        hit
    }

    /// Take before executing the read whose result may be inserted
    pub fn ticket(&self, key: &CacheKey) -> CacheTicket {
        self.generations.lock().ticket(key)
    }

    /// Insert unless an overlapping write invalidated since `ticket` was taken
    pub fn insert(&self, key: CacheKey, value: Value, ticket: CacheTicket) -> bool {
        let generations = self.generations.lock();
        if generations.ticket(&key) != ticket {
            debug!(
                tenant_id = %key.tenant_id,
                fingerprint = %key.fingerprint,
                "discarding read raced by a write"
            );
            return false;
        }
        self.cache.insert(key, value);
        true
    }

    /// Drop cached reads a write may have made stale
    ///
    /// With a spreadsheet id, drops that spreadsheet's reads and the reads
    /// that name no spreadsheet; without one, drops all of the tenant's reads.
    pub fn invalidate_spreadsheet(&self, tenant_id: &str, spreadsheet_id: Option<&str>) -> usize {
        let mut generations = self.generations.lock();
        generations.bump(tenant_id, spreadsheet_id);
        let removed = match spreadsheet_id {
            Some(id) => self.cache.invalidate_where(|key, _| {
                key.tenant_id == tenant_id
                    && key.spreadsheet_id.as_deref().map_or(true, |cached| cached == id)
            }),
            None => self.cache.invalidate_where(|key, _| key.tenant_id == tenant_id),
        };
        if removed > 0 {
            debug!(tenant_id, spreadsheet_id, removed, "invalidated cached reads");
        }
        removed
    }

    #[cfg(test)]
    fn tracked_generations(&self) -> usize {
        self.generations.lock().tracked
    }

    pub fn clear(&self) -> usize {
        self.cache.clear()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use sheetgate_common::{EvictionReason, MockClock};

    use super::*;

    fn cache(ttl_ms: u64, max_entries: usize) -> (ResultCache, MockClock) {
        let clock = MockClock::new();
        let settings = CacheSettings { ttl_ms, max_entries };
        (ResultCache::new(&settings, Arc::new(clock.clone())), clock)
    }

    fn read(spreadsheet: &str, range: &str) -> Operation {
        Operation::new(
            "sheets_data",
            "read",
            json!({ "spreadsheetId": spreadsheet, "range": range }),
        )
    }

    fn store(cache: &ResultCache, key: &CacheKey, value: Value) {
        let ticket = cache.ticket(key);
        assert!(cache.insert(key.clone(), value, ticket));
    }

    /// Validates TTL expiry.
    ///
    /// Assertions:
    /// - Confirms a hit before the TTL and a miss attributed to `ttl_expired` after.
    #[test]
    fn test_entries_expire() {
        let (cache, clock) = cache(1_000, 10);
        let key = CacheKey::for_operation("t1", &read("s1", "A1"));
        store(&cache, &key, json!([[1]]));

        clock.advance_millis(999);
        assert_eq!(cache.get(&key), Some(json!([[1]])));
        clock.advance_millis(1);
        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.stats().evictions(EvictionReason::TtlExpired), 1);
    }

    /// Validates write invalidation scope.
    ///
    /// Assertions:
    /// - Confirms reads of the written spreadsheet and unscoped reads are dropped.
    /// - Ensures other spreadsheets and other tenants are untouched.
    #[test]
    fn test_invalidation_scope() {
        let (cache, _clock) = cache(60_000, 10);
        let s1 = CacheKey::for_operation("t1", &read("s1", "A1"));
        let s2 = CacheKey::for_operation("t1", &read("s2", "A1"));
        let list = Operation::new("sheets_core", "list", json!({}));
        let listing = CacheKey::for_operation("t1", &list);
        let other_tenant = CacheKey::for_operation("t2", &read("s1", "A1"));
        for key in [&s1, &s2, &listing, &other_tenant] {
            store(&cache, key, json!("v"));
        }

        assert_eq!(cache.invalidate_spreadsheet("t1", Some("s1")), 2);
        assert!(cache.get(&s1).is_none());
        assert!(cache.get(&listing).is_none());
        assert!(cache.get(&s2).is_some());
        assert!(cache.get(&other_tenant).is_some());
        assert_eq!(cache.stats().evictions(EvictionReason::Manual), 2);

        assert_eq!(cache.invalidate_spreadsheet("t1", None), 1);
        assert!(cache.get(&other_tenant).is_some());
    }

    /// Validates the stale-insert guard.
    ///
    /// Assertions:
    /// - Confirms a read that started before a write cannot be inserted after it.
    /// - Ensures reads of an unrelated spreadsheet are unaffected.
    #[test]
    fn test_read_raced_by_write_is_discarded() {
        let (cache, _clock) = cache(60_000, 10);
        let s1 = CacheKey::for_operation("t1", &read("s1", "A1"));
        let s2 = CacheKey::for_operation("t1", &read("s2", "A1"));
        let (t1, t2) = (cache.ticket(&s1), cache.ticket(&s2));

        cache.invalidate_spreadsheet("t1", Some("s1"));
        assert!(!cache.insert(s1.clone(), json!("stale"), t1));
        assert!(cache.insert(s2, json!("fresh"), t2));
        assert!(cache.get(&s1).is_none());
    }

    /// Validates the size bound.
    ///
    /// Assertions:
    /// - Confirms the least recently used entry is evicted as `size_limit`.
    #[test]
    fn test_size_bound() {
        let (cache, _clock) = cache(60_000, 2);
        let keys: Vec<CacheKey> = ["A1", "A2", "A3"]
            .iter()
            .map(|range| CacheKey::for_operation("t1", &read("s1", range)))
            .collect();
        store(&cache, &keys[0], json!(0));
        store(&cache, &keys[1], json!(1));
        assert!(cache.get(&keys[0]).is_some());
        store(&cache, &keys[2], json!(2));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&keys[1]).is_none());
        assert_eq!(cache.stats().evictions(EvictionReason::SizeLimit), 1);
    }

    /// Validates that invalidation bookkeeping stays bounded.
    ///
    /// Assertions:
    /// - Confirms writes to many distinct spreadsheets never track more than the bound.
    /// - Ensures a ticket taken before a prune is rejected after it.
    /// - Confirms tickets taken after the prune are accepted.
    #[test]
    fn test_generations_are_bounded() {
        let (cache, _clock) = cache(60_000, 10);
        let early = CacheKey::for_operation("t1", &read("s-early", "A1"));
        let early_ticket = cache.ticket(&early);

        for n in 0..(MIN_TRACKED_GENERATIONS * 3) {
            cache.invalidate_spreadsheet(&format!("t{}", n % 7), Some(&format!("s{n}")));
            assert!(cache.tracked_generations() <= MIN_TRACKED_GENERATIONS);
        }

        assert!(!cache.insert(early.clone(), json!("stale"), early_ticket));
        let fresh = cache.ticket(&early);
        assert!(cache.insert(early.clone(), json!("fresh"), fresh));
        assert_eq!(cache.get(&early), Some(json!("fresh")));
    }
}
