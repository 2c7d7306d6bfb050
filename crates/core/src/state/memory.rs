//! Process-local state store
//!
//! State lives in `DashMap`s; every check-and-update runs while holding the
//! entry lock of the one key it touches. Quota counters are grouped per
//! tenant and class so that the three windows of one admission share a
//! single entry lock. Nothing survives a restart and nothing is shared with
//! other processes, so this store always reports itself as degraded.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use sheetgate_common::{CallAdmission, CallOutcome, CircuitBreakerConfig, CircuitSnapshot};
use sheetgate_domain::{QuotaCounterKey, QuotaDemand, QuotaWindow};

use super::ports::{
    CircuitUpdate, QuotaConsumeOutcome, StateStore, StoreDescriptor, StoreError, StoreResult,
};

#[derive(Debug)]
struct WindowCounter {
    bucket: String,
    count: u64,
}

#[derive(Debug, Default)]
struct QuotaCell {
    windows: HashMap<QuotaWindow, WindowCounter>,
}

// Bucket labels sort chronologically, so `<` on them is "earlier window".
impl QuotaCell {
    fn count(&self, window: QuotaWindow, bucket: &str) -> u64 {
        match self.windows.get(&window) {
            Some(counter) if counter.bucket.as_str() >= bucket => counter.count,
            _ => 0,
        }
    }

    fn add(&mut self, window: QuotaWindow, bucket: &str, cost: u64) -> u64 {
        let counter = self
            .windows
            .entry(window)
            .or_insert_with(|| WindowCounter { bucket: bucket.to_string(), count: 0 });
        if counter.bucket.as_str() < bucket {
            // New window instance: the old counter is dropped, not carried
            counter.bucket = bucket.to_string();
            counter.count = 0;
        }
        counter.count = counter.count.saturating_add(cost);
        counter.count
    }

    fn release(&mut self, window: QuotaWindow, bucket: &str, cost: u64) {
        if let Some(counter) = self.windows.get_mut(&window) {
            if counter.bucket == bucket {
                counter.count = counter.count.saturating_sub(cost);
            }
        }
    }
}

fn scope_of(key: &QuotaCounterKey) -> String {
    format!("{}|{}", key.tenant_id, key.class)
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    quotas: DashMap<String, QuotaCell>,
    circuits: DashMap<String, CircuitSnapshot>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    fn descriptor(&self) -> StoreDescriptor {
        StoreDescriptor { backend: "memory".to_string(), shared: false, location: None }
    }

    async fn quota_try_consume(
        &self,
        demands: &[QuotaDemand],
        cost: u64,
    ) -> StoreResult<QuotaConsumeOutcome> {
        let Some(first) = demands.first() else {
            return Ok(QuotaConsumeOutcome::Admitted { counts: Vec::new() });
        };
        let scope = scope_of(&first.key);
        if demands.iter().any(|demand| scope_of(&demand.key) != scope) {
            return Err(StoreError::InvalidRequest {
                message: "quota demands span more than one tenant and class".to_string(),
            });
        }

        let mut cell = self.quotas.entry(scope).or_default();
        for (index, demand) in demands.iter().enumerate() {
            let current = cell.count(demand.key.window, &demand.key.bucket);
            if demand.limit.is_some_and(|limit| current.saturating_add(cost) > limit) {
                return Ok(QuotaConsumeOutcome::Rejected { index, count: current });
            }
        }
        let counts = demands
            .iter()
            .map(|demand| cell.add(demand.key.window, &demand.key.bucket, cost))
            .collect();
        Ok(QuotaConsumeOutcome::Admitted { counts })
    }

    async fn quota_release(&self, keys: &[QuotaCounterKey], cost: u64) -> StoreResult<()> {
        for key in keys {
            if let Some(mut cell) = self.quotas.get_mut(&scope_of(key)) {
                cell.release(key.window, &key.bucket, cost);
            }
        }
        Ok(())
    }

    async fn quota_counts(&self, keys: &[QuotaCounterKey]) -> StoreResult<Vec<u64>> {
        Ok(keys
            .iter()
            .map(|key| {
                self.quotas
                    .get(&scope_of(key))
                    .map_or(0, |cell| cell.count(key.window, &key.bucket))
            })
            .collect())
    }

    async fn circuit_acquire(
        &self,
        name: &str,
        now_ms: u64,
        config: &CircuitBreakerConfig,
    ) -> StoreResult<CallAdmission> {
        let mut snapshot = self.circuits.entry(name.to_string()).or_default();
        Ok(snapshot.try_acquire(now_ms, config))
    }

    async fn circuit_record(
        &self,
        name: &str,
        outcome: CallOutcome,
        trial: bool,
        now_ms: u64,
        config: &CircuitBreakerConfig,
    ) -> StoreResult<CircuitUpdate> {
        let mut snapshot = self.circuits.entry(name.to_string()).or_default();
        let previous = snapshot.state;
        snapshot.record(outcome, trial, now_ms, config);
        Ok(CircuitUpdate { previous, current: snapshot.clone() })
    }

    async fn circuit_snapshot(&self, name: &str) -> StoreResult<CircuitSnapshot> {
        Ok(self.circuits.get(name).map(|snapshot| snapshot.clone()).unwrap_or_default())
    }

    async fn circuit_snapshots(&self) -> StoreResult<Vec<(String, CircuitSnapshot)>> {
        let mut all: Vec<(String, CircuitSnapshot)> = self
            .circuits
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }

    async fn circuit_reset(&self, name: &str) -> StoreResult<()> {
        self.circuits.insert(name.to_string(), CircuitSnapshot::default());
        Ok(())
    }
}
