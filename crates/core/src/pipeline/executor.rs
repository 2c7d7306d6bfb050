//! Execution pipeline for single upstream calls
//!
//! Order of gates for one call:
//! 1. class lookup in the action table
//! 2. read result cache (reads only)
//! 3. in-flight deduplication (the leader runs everything below)
//! 4. expected-state check, then quota admission
//! 5. retry loop around: circuit admission, connection health check,
//!    upstream call, outcome recording
//! 6. cache insert for reads, cache invalidation for writes
//!
//! Quota and circuit rejections end the call; only transient upstream
//! errors are retried. A call that never reached the upstream gets its
//! quota charge back.
//!
//! A write that reached the upstream drops the cached reads it may have
//! made stale and detaches in-flight reads of the same spreadsheet, so a
//! read issued after the write never joins one that started before it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sheetgate_common::resilience::policies::ClassifiedRetry;
use sheetgate_common::{
    BackoffStrategy, CallOutcome, ErrorClassification, ErrorSeverity, Jitter, RetryConfig,
    RetryError,
    RetryExecutor,
};
use sheetgate_domain::{
    classify, ActionProfile, GatewayError, HealthSignal, Operation, OperationClass, RetrySettings,
    StateTarget,
    UpstreamService,
};
use tracing::{debug, instrument, warn};

use crate::circuit::CircuitRegistry;
use crate::dedup::{CacheKey, DedupKey, RequestDeduplicator, ResultCache};
use crate::health::ConnectionHealthMonitor;
use crate::quota::QuotaLedger;
use crate::upstream::{BreakerOutcome, SpreadsheetApi, UpstreamError};

/// Why one attempt did not produce a value
#[derive(Debug)]
enum AttemptError {
    /// Refused before reaching the upstream (open circuit, store failure)
    Rejected(GatewayError),
    Upstream(UpstreamError),
}

impl ErrorClassification for AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Rejected(_) => false,
            Self::Upstream(err) => err.is_retryable(),
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Rejected(_) => ErrorSeverity::Warning,
            Self::Upstream(err) => err.severity(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Rejected(_) => None,
            Self::Upstream(err) => err.retry_after(),
        }
    }
}

fn into_gateway_error(err: RetryError<AttemptError>) -> GatewayError {
    match err {
        RetryError::InvalidConfiguration { message } => GatewayError::config(message),
        other => match other.into_source() {
            Some(AttemptError::Rejected(err)) => err,
            Some(AttemptError::Upstream(err)) => err.into(),
            None => GatewayError::internal("retry loop ended without an attempt"),
        },
    }
}

/// Exponential backoff with equal jitter, bounded by the settings
pub fn retry_config(settings: &RetrySettings) -> RetryConfig {
    let max_delay = Duration::from_millis(settings.max_delay_ms);
    RetryConfig {
        max_attempts: settings.max_attempts.max(1),
        backoff: BackoffStrategy::Exponential {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            base: 2.0,
            max_delay,
        },
        jitter: Jitter::Equal,
        max_total_time: Some(max_delay.saturating_mul(settings.max_attempts.max(1))),
    }
}

/// Services every upstream call passes through
#[derive(Clone)]
pub struct ExecutionPipeline {
    api: Arc<dyn SpreadsheetApi>,
    quota: Arc<QuotaLedger>,
    circuits: Arc<CircuitRegistry>,
    health: Arc<ConnectionHealthMonitor>,
    cache: Arc<ResultCache>,
    dedup: Arc<RequestDeduplicator>,
    retry: RetryExecutor<ClassifiedRetry>,
}

impl ExecutionPipeline {
    pub fn new(
        api: Arc<dyn SpreadsheetApi>,
        quota: Arc<QuotaLedger>,
        circuits: Arc<CircuitRegistry>,
        health: Arc<ConnectionHealthMonitor>,
        cache: Arc<ResultCache>,
        dedup: Arc<RequestDeduplicator>,
        retry: &RetrySettings,
    ) -> Self {
        Self {
            api,
            quota,
            circuits,
            health,
            cache,
            dedup,
            retry: RetryExecutor::new(retry_config(retry), ClassifiedRetry),
        }
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    pub fn health(&self) -> &ConnectionHealthMonitor {
        &self.health
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn dedup(&self) -> &RequestDeduplicator {
        &self.dedup
    }

    /// Execute one operation on behalf of `tenant_id`
    ///
    /// Operations carrying an expected state are conditional: they are
    /// checked against current upstream values first and are neither
    /// deduplicated nor cached.
    #[instrument(
        skip(self, operation),
        fields(tool = %operation.tool(), action = %operation.action())
    )]
    pub async fn execute(
        &self,
        tenant_id: &str,
        operation: Operation,
    ) -> Result<Value, GatewayError> {
        let profile = classify(operation.tool(), operation.action());
        if !profile.known {
            debug!("action not in the action table; charged as write");
        }

        if operation.expected_state().is_some() {
            self.verify_expected_state(tenant_id, &operation).await?;
            return self.lead(tenant_id, &operation, profile, None, true).await;
        }

        let cache_key = profile
            .class
            .is_read_only()
            .then(|| CacheKey::for_operation(tenant_id, &operation));
        if let Some(value) = cache_key.as_ref().and_then(|key| self.cache.get(key)) {
            return Ok(value);
        }

        let mut key = DedupKey::new(tenant_id, operation.fingerprint().clone());
        if profile.class.is_read_only() {
            key = key.reading(operation.spreadsheet_id());
        }
        let this = self.clone();
        let tenant = tenant_id.to_string();
        self.dedup
            .run(key, async move { this.lead(&tenant, &operation, profile, cache_key, true).await })
            .await
    }

    /// Execute without the expected-state check; the caller has already
    /// compared the expected state against values it read itself
    pub(crate) async fn execute_verified(
        &self,
        tenant_id: &str,
        operation: &Operation,
    ) -> Result<Value, GatewayError> {
        let profile = classify(operation.tool(), operation.action());
        self.lead(tenant_id, operation, profile, None, true).await
    }

    /// Undo an applied change
    ///
    /// Not charged against quota: a tenant that ran out of write quota
    /// mid-transaction must still be able to restore what it changed.
    pub(crate) async fn execute_compensation(
        &self,
        tenant_id: &str,
        operation: &Operation,
    ) -> Result<Value, GatewayError> {
        let profile = classify(operation.tool(), operation.action());
        self.lead(tenant_id, operation, profile, None, false).await
    }

    /// Read the current values of `target`, charged as one read
    #[instrument(
        skip(self, target),
        fields(spreadsheet_id = %target.spreadsheet_id, range = %target.range)
    )]
    pub async fn read_state(
        &self,
        tenant_id: &str,
        target: &StateTarget,
    ) -> Result<Value, GatewayError> {
        let charge = self.quota.admit(tenant_id, OperationClass::Read, 1).await?;
        let pool = UpstreamService::Sheets.circuit_name();
        let dispatched = AtomicBool::new(false);
        let result = self
            .retry
            .execute(|_| self.attempt(pool, &dispatched, || self.api.read_state(target)))
            .await
            .map_err(into_gateway_error);
        if !dispatched.load(Ordering::Acquire) {
            self.quota.refund(charge).await;
        }
        result
    }

    /// Compare an operation's expected state with current upstream values
    pub async fn verify_expected_state(
        &self,
        tenant_id: &str,
        operation: &Operation,
    ) -> Result<(), GatewayError> {
        let Some(expected) = operation.expected_state() else {
            return Ok(());
        };
        let target = operation.state_target().ok_or_else(|| {
            GatewayError::invalid_input(format!(
                "{} carries an expected state but names no spreadsheetId and range",
                operation.qualified_name()
            ))
        })?;
        let current = self.read_state(tenant_id, &target).await?;
        if expected.matches(&current) {
            Ok(())
        } else {
            warn!(
                spreadsheet_id = %target.spreadsheet_id,
                range = %target.range,
                "expected state does not match upstream"
            );
            Err(GatewayError::Conflict {
                spreadsheet_id: target.spreadsheet_id,
                range: target.range,
                operation_index: None,
            })
        }
    }

    async fn lead(
        &self,
        tenant_id: &str,
        operation: &Operation,
        profile: ActionProfile,
        cache_key: Option<CacheKey>,
        charged: bool,
    ) -> Result<Value, GatewayError> {
        let charge = if charged {
            Some(self.quota.admit(tenant_id, profile.class, 1).await?)
        } else {
            None
        };

        let ticket = cache_key.as_ref().map(|key| self.cache.ticket(key));
        let pool = profile.service.circuit_name();
        let dispatched = AtomicBool::new(false);
        let result = self
            .retry
            .execute(|_| self.attempt(pool, &dispatched, || self.api.call(operation)))
            .await
            .map_err(into_gateway_error);

        let dispatched = dispatched.load(Ordering::Acquire);
        if !profile.class.is_read_only() && dispatched {
            self.cache.invalidate_spreadsheet(tenant_id, operation.spreadsheet_id());
            self.dedup.detach_reads(tenant_id, operation.spreadsheet_id());
        }
        if let (false, Some(charge)) = (dispatched, charge) {
            self.quota.refund(charge).await;
        }
        if let (Ok(value), Some(key), Some(ticket)) = (&result, cache_key, ticket) {
            self.cache.insert(key, value.clone(), ticket);
        }
        result
    }

    async fn attempt<F, Fut>(
        &self,
        pool: &str,
        dispatched: &AtomicBool,
        call: F,
    ) -> Result<Value, AttemptError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, UpstreamError>>,
    {
        let permit = self.circuits.acquire(pool).await.map_err(AttemptError::Rejected)?;
        self.prepare_connection(pool).await;

        dispatched.store(true, Ordering::Release);
        let result = call().await;

        let (outcome, alive) = match &result {
            Ok(_) => (CallOutcome::Success, true),
            Err(err) => (err.call_outcome(), err.kind.connection_alive()),
        };
        self.health.record_outcome(pool, alive);
        if let Err(err) = self.circuits.record(permit, outcome).await {
            warn!(pool, error = %err, "failed to record circuit outcome");
        }
        result.map_err(AttemptError::Upstream)
    }

    /// Recycle the pool first when the health monitor asks for it
    async fn prepare_connection(&self, pool: &str) {
        match self.health.check(pool) {
            HealthSignal::Healthy => {}
            signal => {
                debug!(pool, ?signal, "recycling connection pool before call");
                match self.api.reset_connection(pool).await {
                    Ok(()) => self.health.mark_reset(pool),
                    Err(err) => {
                        warn!(pool, error = %err, "connection reset failed; calling anyway");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use sheetgate_common::{CircuitBreakerConfig, CircuitState, MockClock};
    use sheetgate_domain::{
        CacheSettings, ErrorCode, ExpectedState, HealthSettings, QuotaPolicy, QuotaWindow,
    };

    use super::*;
    use crate::state::InMemoryStateStore;
    use crate::testing::ScriptedSpreadsheetApi;

    struct Harness {
        api: Arc<ScriptedSpreadsheetApi>,
        pipeline: ExecutionPipeline,
    }

    fn harness() -> Harness {
        harness_with_threshold(5)
    }

    fn harness_with_threshold(failure_threshold: u64) -> Harness {
        let clock: crate::SharedClock = Arc::new(MockClock::at_millis(1_800_000_000_000));
        let store = Arc::new(InMemoryStateStore::new());
        let api = Arc::new(
            ScriptedSpreadsheetApi::new().with_range("s1", "A1:B2", json!([[1, 2], [3, 4]])),
        );
        let breaker = CircuitBreakerConfig::builder()
            .failure_threshold(failure_threshold)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("breaker");
        let retry = RetrySettings { max_attempts: 3, initial_delay_ms: 1, max_delay_ms: 5 };
        let pipeline = ExecutionPipeline::new(
            api.clone(),
            Arc::new(QuotaLedger::new(store.clone(), QuotaPolicy::default(), clock.clone())),
            Arc::new(CircuitRegistry::new(store, breaker, clock.clone())),
            Arc::new(ConnectionHealthMonitor::new(HealthSettings::default(), clock.clone())),
            Arc::new(ResultCache::new(&CacheSettings::default(), clock)),
            Arc::new(RequestDeduplicator::new()),
            &retry,
        );
        Harness { api, pipeline }
    }

    fn read() -> Operation {
        Operation::new("sheets_data", "read", json!({ "spreadsheetId": "s1", "range": "A1:B2" }))
    }

    fn write(values: Value) -> Operation {
        Operation::new(
            "sheets_data",
            "write",
            json!({ "spreadsheetId": "s1", "range": "A1:B2", "values": values }),
        )
    }

    /// Validates that transient errors are retried within the budget.
    ///
    /// Assertions:
    /// - Confirms two 503s followed by success yield the value after three calls.
    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let h = harness();
        h.api.fail_times("sheets_data.read", 2, UpstreamError::from_status(503, "busy"));

        let value = h.pipeline.execute("t1", read()).await.expect("value after retries");
        assert_eq!(value["values"], json!([[1, 2], [3, 4]]));
        assert_eq!(h.api.call_count("sheets_data.read"), 3);
    }

    /// Validates that auth errors surface immediately.
    ///
    /// Assertions:
    /// - Confirms one call, AUTHENTICATION_FAILED, and a closed circuit.
    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let h = harness();
        h.api.fail_always("sheets_data.read", UpstreamError::from_status(401, "token expired"));

        let err = h.pipeline.execute("t1", read()).await.expect_err("auth");
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
        assert_eq!(h.api.call_count("sheets_data.read"), 1);
        let circuit = h.pipeline.circuits().state("sheets").await.expect("state");
        assert_eq!((circuit.state, circuit.consecutive_failures), (CircuitState::Closed, 0));
    }

    /// Validates read caching and write invalidation.
    ///
    /// Assertions:
    /// - Confirms a repeated read is served without an upstream call.
    /// - Ensures a read after a write observes the written values.
    #[tokio::test]
    async fn test_cache_and_invalidation() {
        let h = harness();
        h.pipeline.execute("t1", read()).await.expect("first read");
        h.pipeline.execute("t1", read()).await.expect("cached read");
        assert_eq!(h.api.call_count("sheets_data.read"), 1);

        h.pipeline.execute("t1", write(json!([[9, 9], [9, 9]]))).await.expect("write");
        let after = h.pipeline.execute("t1", read()).await.expect("fresh read");
        assert_eq!(after["values"], json!([[9, 9], [9, 9]]));
        assert_eq!(h.api.call_count("sheets_data.read"), 2);
    }

    /// Validates that a failed write still invalidates.
    ///
    /// Assertions:
    /// - Ensures a write that reached upstream and failed drops the cached read.
    #[tokio::test]
    async fn test_failed_write_invalidates() {
        let h = harness();
        h.pipeline.execute("t1", read()).await.expect("read");
        h.api.fail_always("sheets_data.write", UpstreamError::from_status(400, "bad values"));
        assert!(h.pipeline.execute("t1", write(json!([[0]]))).await.is_err());

        h.pipeline.execute("t1", read()).await.expect("read again");
        assert_eq!(h.api.call_count("sheets_data.read"), 2);
    }

    /// Validates that a write detaches reads already in flight.
    ///
    /// Assertions:
    /// - Ensures a read issued after the write does not join the earlier read.
    /// - Confirms the earlier read keeps the values it saw.
    #[tokio::test]
    async fn test_write_detaches_in_flight_read() {
        let h = harness();
        h.api.set_latency("sheets_data.read", Duration::from_millis(50));

        let early = tokio::spawn({
            let pipeline = h.pipeline.clone();
            async move { pipeline.execute("t1", read()).await }
        });
        while h.api.call_count("sheets_data.read") == 0 {
            tokio::task::yield_now().await;
        }

        h.pipeline.execute("t1", write(json!([[7, 7], [7, 7]]))).await.expect("write");
        let late = h.pipeline.execute("t1", read()).await.expect("late read");
        assert_eq!(late["values"], json!([[7, 7], [7, 7]]));

        let early = early.await.expect("join").expect("early read");
        assert_eq!(early["values"], json!([[1, 2], [3, 4]]));
        assert_eq!(h.api.call_count("sheets_data.read"), 2);
        assert_eq!(h.pipeline.dedup().stats().joined, 0);
    }

    /// Validates that calls refused before dispatch do not consume quota.
    ///
    /// Assertions:
    /// - Confirms only the dispatched write is counted once the circuit opens.
    /// - Ensures fail-fast rejections leave the hourly write count unchanged.
    #[tokio::test]
    async fn test_fail_fast_rejections_are_refunded() {
        let h = harness_with_threshold(1);
        h.api.fail_next("sheets_data.write", UpstreamError::from_status(503, "busy"));

        assert!(h.pipeline.execute("t1", write(json!([[1]]))).await.is_err());
        for _ in 0..3 {
            let err =
                h.pipeline.execute("t1", write(json!([[2]]))).await.expect_err("open circuit");
            assert!(matches!(err, GatewayError::CircuitOpen { .. }), "{err:?}");
        }

        assert_eq!(h.api.call_count("sheets_data.write"), 1);
        let usage = h.pipeline.quota().usage_stats("t1").await.expect("usage");
        let hourly = usage.entry(OperationClass::Write, QuotaWindow::Hourly).expect("entry");
        assert_eq!(hourly.count, 1);
    }

    /// Validates conditional writes.
    ///
    /// Assertions:
    /// - Confirms a stale expected state yields CONFLICT without writing.
    /// - Confirms a matching expected state lets the write through.
    #[tokio::test]
    async fn test_expected_state_gates_writes() {
        let h = harness();
        let stale = write(json!([[5]]))
            .with_expected_state(ExpectedState::values(json!([[0, 0], [0, 0]])));
        let err = h.pipeline.execute("t1", stale).await.expect_err("conflict");
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert_eq!(h.api.call_count("sheets_data.write"), 0);

        let current = write(json!([[5]]))
            .with_expected_state(ExpectedState::values(json!([[1, 2], [3, 4]])));
        h.pipeline.execute("t1", current).await.expect("write");
        assert_eq!(h.api.call_count("sheets_data.write"), 1);
    }

    /// Validates pool recycling after repeated connection errors.
    ///
    /// Assertions:
    /// - Confirms the pool is reset before the call following three failures.
    #[tokio::test]
    async fn test_unhealthy_pool_is_reset() {
        let h = harness();
        h.api.fail_times("sheets_data.read", 3, UpstreamError::stream_reset("goaway"));
        assert!(h.pipeline.execute("t1", read()).await.is_err());
        assert_eq!(h.pipeline.health().record("sheets").consecutive_errors, 3);

        h.pipeline.execute("t1", read()).await.expect("recovered");
        assert_eq!(h.api.reset_count(), 1);
        assert_eq!(h.pipeline.health().record("sheets").consecutive_errors, 0);
    }

    /// Validates the retry configuration derived from settings.
    ///
    /// Assertions:
    /// - Confirms attempts, backoff bounds and the total budget.
    #[test]
    fn test_retry_config_from_settings() {
        let config = retry_config(&RetrySettings {
            max_attempts: 4,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
        });
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.jitter, Jitter::Equal);
        assert_eq!(config.max_total_time, Some(Duration::from_secs(8)));
        assert_eq!(config.backoff.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff.calculate_delay(10), Duration::from_secs(2));
    }
}
