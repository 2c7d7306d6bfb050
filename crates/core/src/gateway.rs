//! Gateway facade
//!
//! [`Gateway`] is the single handle action handlers hold. It owns the
//! services, wires them into one [`ExecutionPipeline`], and exposes the
//! transaction and introspection surface. Cloning is cheap.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sheetgate_common::{CacheStats, CircuitBreakerConfig, SystemClock};
use sheetgate_domain::{
    CircuitBreakerSettings, CommitReport, ConnectionHealthRecord, GatewayConfig, GatewayError,
    Operation, QuotaPolicy, TransactionId, TransactionSummary, UsageStats,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::circuit::{CircuitRegistry, CircuitStatus};
use crate::dedup::{CacheKey, DedupStats, RequestDeduplicator, ResultCache};
use crate::health::ConnectionHealthMonitor;
use crate::pipeline::ExecutionPipeline;
use crate::quota::QuotaLedger;
use crate::state::{StateStore, StoreDescriptor};
use crate::transaction::TransactionCoordinator;
use crate::upstream::SpreadsheetApi;
use crate::SharedClock;

/// Which state backend is in use and whether it is shared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    pub backend: String,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl From<StoreDescriptor> for StoreStatus {
    fn from(descriptor: StoreDescriptor) -> Self {
        Self {
            degraded: descriptor.degraded(),
            backend: descriptor.backend,
            location: descriptor.location,
        }
    }
}

/// Every gauge the gateway exposes, read at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySnapshot {
    pub circuits: Vec<CircuitStatus>,
    pub connections: Vec<ConnectionHealthRecord>,
    pub cache: CacheStats,
    pub dedup: DedupStats,
    pub store: StoreStatus,
    pub usage: Vec<UsageStats>,
}

pub(crate) fn breaker_config(
    settings: &CircuitBreakerSettings,
) -> Result<CircuitBreakerConfig, GatewayError> {
    CircuitBreakerConfig::builder()
        .failure_threshold(settings.failure_threshold)
        .timeout(Duration::from_millis(settings.timeout_ms))
        .half_open_max_calls(settings.half_open_max_calls)
        .build()
        .map_err(|err| GatewayError::config(format!("circuit_breaker: {err}")))
}

pub struct GatewayBuilder {
    api: Arc<dyn SpreadsheetApi>,
    store: Arc<dyn StateStore>,
    config: GatewayConfig,
    clock: Option<SharedClock>,
    eviction_listener: Option<sheetgate_common::cache::EvictionListener<CacheKey>>,
}

impl GatewayBuilder {
    pub fn new(api: Arc<dyn SpreadsheetApi>, store: Arc<dyn StateStore>) -> Self {
        Self { api, store, config: GatewayConfig::default(), clock: None, eviction_listener: None }
    }

    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to the system clock
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Observe result-cache evictions (metrics)
    #[must_use]
    pub fn cache_eviction_listener(
        mut self,
        listener: sheetgate_common::cache::EvictionListener<CacheKey>,
    ) -> Self {
        self.eviction_listener = Some(listener);
        self
    }

    pub fn build(self) -> Result<Gateway, GatewayError> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let breaker = breaker_config(&self.config.circuit_breaker)?;

        let descriptor = self.store.descriptor();
        if descriptor.degraded() {
            warn!(
                backend = %descriptor.backend,
                "state store is process-local; quota and circuit state reset on restart"
            );
        } else {
            info!(
                backend = %descriptor.backend,
                location = ?descriptor.location,
                "using shared state store"
            );
        }

        let mut cache = ResultCache::new(&self.config.cache, clock.clone());
        if let Some(listener) = self.eviction_listener {
            cache = cache.with_eviction_listener(listener);
        }
        let pipeline = ExecutionPipeline::new(
            self.api,
            Arc::new(QuotaLedger::new(
                self.store.clone(),
                self.config.quota.clone(),
                clock.clone(),
            )),
            Arc::new(CircuitRegistry::new(self.store.clone(), breaker, clock.clone())),
            Arc::new(ConnectionHealthMonitor::new(
                self.config.connection_health.clone(),
                clock.clone(),
            )),
            Arc::new(cache),
            Arc::new(RequestDeduplicator::new()),
            &self.config.retry,
        );
        let transactions =
            TransactionCoordinator::new(pipeline.clone(), self.config.transactions.clone(), clock);

        Ok(Gateway { pipeline, transactions, store: self.store })
    }
}

#[derive(Clone)]
pub struct Gateway {
    pipeline: ExecutionPipeline,
    transactions: TransactionCoordinator,
    store: Arc<dyn StateStore>,
}

impl Gateway {
    pub fn builder(api: Arc<dyn SpreadsheetApi>, store: Arc<dyn StateStore>) -> GatewayBuilder {
        GatewayBuilder::new(api, store)
    }

    /// Run one operation outside any transaction
    pub async fn execute(
        &self,
        tenant_id: &str,
        operation: Operation,
    ) -> Result<Value, GatewayError> {
        self.pipeline.execute(tenant_id, operation).await
    }

    pub fn begin(&self, tenant_id: &str) -> Result<TransactionId, GatewayError> {
        self.transactions.begin(tenant_id)
    }

    pub fn queue(
        &self,
        transaction_id: TransactionId,
        operation: Operation,
    ) -> Result<usize, GatewayError> {
        self.transactions.queue(transaction_id, operation)
    }

    pub async fn commit(
        &self,
        transaction_id: TransactionId,
    ) -> Result<CommitReport, GatewayError> {
        self.transactions.commit(transaction_id).await
    }

    pub fn rollback(
        &self,
        transaction_id: TransactionId,
    ) -> Result<TransactionSummary, GatewayError> {
        self.transactions.rollback(transaction_id)
    }

    pub fn status(
        &self,
        transaction_id: TransactionId,
    ) -> Result<TransactionSummary, GatewayError> {
        self.transactions.status(transaction_id)
    }

    pub fn list_transactions(&self, tenant_id: Option<&str>) -> Vec<TransactionSummary> {
        self.transactions.list(tenant_id)
    }

    pub fn purge_expired(&self) -> usize {
        self.transactions.purge_expired()
    }

    /// Start the background transaction reaper at the configured interval
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let interval =
            Duration::from_millis(self.transactions.settings().reaper_interval_ms.max(1));
        self.transactions.spawn_reaper(interval)
    }

    pub async fn get_usage_stats(&self, tenant_id: &str) -> Result<UsageStats, GatewayError> {
        self.pipeline.quota().usage_stats(tenant_id).await
    }

    pub fn set_quota_policy(&self, policy: QuotaPolicy) {
        self.pipeline.quota().set_policy(policy);
    }

    pub async fn get_circuit_state(&self, circuit: &str) -> Result<CircuitStatus, GatewayError> {
        self.pipeline.circuits().state(circuit).await
    }

    pub async fn get_circuit_states(&self) -> Result<Vec<CircuitStatus>, GatewayError> {
        self.pipeline.circuits().states().await
    }

    /// Force a circuit back to CLOSED
    pub async fn reset_circuit(&self, circuit: &str) -> Result<(), GatewayError> {
        self.pipeline.circuits().reset(circuit).await
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.pipeline.cache().stats()
    }

    pub fn clear_cache(&self) -> usize {
        self.pipeline.cache().clear()
    }

    pub fn get_dedup_stats(&self) -> DedupStats {
        self.pipeline.dedup().stats()
    }

    pub fn connection_health(&self) -> Vec<ConnectionHealthRecord> {
        self.pipeline.health().snapshot()
    }

    pub fn store_status(&self) -> StoreStatus {
        self.store.descriptor().into()
    }

    /// Gauges for every circuit, pool and tenant seen so far
    pub async fn snapshot(&self) -> Result<GatewaySnapshot, GatewayError> {
        let mut usage = Vec::new();
        for tenant in self.pipeline.quota().known_tenants() {
            usage.push(self.pipeline.quota().usage_stats(&tenant).await?);
        }
        Ok(GatewaySnapshot {
            circuits: self.pipeline.circuits().states().await?,
            connections: self.connection_health(),
            cache: self.get_cache_stats(),
            dedup: self.get_dedup_stats(),
            store: self.store_status(),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sheetgate_common::MockClock;
    use sheetgate_domain::ErrorCode;

    use super::*;
    use crate::state::InMemoryStateStore;
    use crate::testing::ScriptedSpreadsheetApi;

    fn gateway(config: GatewayConfig) -> (Gateway, Arc<ScriptedSpreadsheetApi>) {
        let api = Arc::new(ScriptedSpreadsheetApi::new());
        let gateway = Gateway::builder(api.clone(), Arc::new(InMemoryStateStore::new()))
            .config(config)
            .clock(Arc::new(MockClock::at_millis(1_800_000_000_000)))
            .build()
            .expect("gateway");
        (gateway, api)
    }

    /// Validates configuration checks at build time.
    ///
    /// Assertions:
    /// - Ensures a zero failure threshold is rejected.
    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = GatewayConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        let api = Arc::new(ScriptedSpreadsheetApi::new());
        let result = Gateway::builder(api, Arc::new(InMemoryStateStore::new()))
            .config(config)
            .build();
        assert!(matches!(result, Err(GatewayError::Config { .. })));
    }

    /// Validates the introspection surface.
    ///
    /// Assertions:
    /// - Confirms the in-memory store reports degraded mode.
    /// - Confirms the snapshot covers the tenant and circuit that were used.
    #[tokio::test]
    async fn test_snapshot_after_traffic() {
        let (gateway, _api) = gateway(GatewayConfig::default());
        gateway
            .execute(
                "t1",
                Operation::new(
                    "sheets_data",
                    "read",
                    json!({ "spreadsheetId": "s1", "range": "A1" }),
                ),
            )
            .await
            .expect("read");

        assert!(gateway.store_status().degraded);
        let snapshot = gateway.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.usage.len(), 1);
        assert_eq!(snapshot.usage[0].tenant_id, "t1");
        assert!(snapshot.circuits.iter().any(|c| c.name == "sheets"));
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.dedup.executions, 1);
    }

    /// Validates quota policy replacement at runtime.
    ///
    /// Assertions:
    /// - Confirms a lowered limit applies to the next call.
    #[tokio::test]
    async fn test_set_quota_policy() {
        let (gateway, _api) = gateway(GatewayConfig::default());
        let mut policy = QuotaPolicy::default();
        policy.defaults.for_class_mut(sheetgate_domain::OperationClass::Write).hourly = Some(0);
        gateway.set_quota_policy(policy);

        let err = gateway
            .execute(
                "t1",
                Operation::new(
                    "sheets_core",
                    "add_sheet",
                    json!({ "spreadsheetId": "s1", "title": "x" }),
                ),
            )
            .await
            .expect_err("limited");
        assert_eq!(err.code(), ErrorCode::RateLimited);
    }
}
