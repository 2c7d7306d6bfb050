use std::sync::Arc;

use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use sheetgate_common::cache::EvictionListener;
use sheetgate_common::EvictionReason;
use sheetgate_core::{CacheKey, GatewaySnapshot};

use super::{MetricsError, MetricsResult};

/// Prometheus view of a [`GatewaySnapshot`]
///
/// Gauges are overwritten on every [`update_from`](Self::update_from).
/// Hit, miss and saved-call counters advance by the difference from the
/// previous snapshot; eviction counters are fed live by the listener from
/// [`eviction_listener`](Self::eviction_listener).
pub struct MetricsExporter {
    registry: Registry,
    /// 0=CLOSED, 1=HALF_OPEN, 2=OPEN
    circuit_state: IntGaugeVec,
    circuit_consecutive_failures: IntGaugeVec,
    connection_consecutive_errors: IntGaugeVec,
    connection_health_score: IntGaugeVec,
    quota_usage_percent: GaugeVec,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    cache_evictions: IntCounterVec,
    dedup_saved_calls: IntCounter,
    state_store_degraded: IntGauge,
}

impl MetricsExporter {
    /// Exporter with its own registry
    pub fn new() -> MetricsResult<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register every gateway metric on `registry`
    pub fn with_registry(registry: Registry) -> MetricsResult<Self> {
        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "sheetgate_circuit_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            ),
            &["circuit"],
        )?;
        registry.register(Box::new(circuit_state.clone()))?;

        let circuit_consecutive_failures = IntGaugeVec::new(
            Opts::new(
                "sheetgate_circuit_consecutive_failures",
                "Consecutive failures counted by the breaker",
            ),
            &["circuit"],
        )?;
        registry.register(Box::new(circuit_consecutive_failures.clone()))?;

        let connection_consecutive_errors = IntGaugeVec::new(
            Opts::new(
                "sheetgate_connection_consecutive_errors",
                "Consecutive connection-level errors per pool",
            ),
            &["pool"],
        )?;
        registry.register(Box::new(connection_consecutive_errors.clone()))?;

        let connection_health_score = IntGaugeVec::new(
            Opts::new(
                "sheetgate_connection_health_score",
                "Weighted recent success ratio per pool (0-100)",
            ),
            &["pool"],
        )?;
        registry.register(Box::new(connection_health_score.clone()))?;

        let quota_usage_percent = GaugeVec::new(
            Opts::new("sheetgate_quota_usage_percent", "Share of the quota window consumed"),
            &["tenant", "class", "window"],
        )?;
        registry.register(Box::new(quota_usage_percent.clone()))?;

        let cache_hits =
            IntCounter::new("sheetgate_cache_hits_total", "Reads served from the result cache")?;
        registry.register(Box::new(cache_hits.clone()))?;

        let cache_misses =
            IntCounter::new("sheetgate_cache_misses_total", "Cache lookups that missed")?;
        registry.register(Box::new(cache_misses.clone()))?;

        let cache_evictions = IntCounterVec::new(
            Opts::new("sheetgate_cache_evictions_total", "Result cache evictions"),
            &["reason"],
        )?;
        registry.register(Box::new(cache_evictions.clone()))?;

        let dedup_saved_calls = IntCounter::new(
            "sheetgate_dedup_saved_calls_total",
            "Callers that joined an identical in-flight request",
        )?;
        registry.register(Box::new(dedup_saved_calls.clone()))?;

        let state_store_degraded = IntGauge::new(
            "sheetgate_state_store_degraded",
            "1 when quota and circuit state are process-local",
        )?;
        registry.register(Box::new(state_store_degraded.clone()))?;

        for reason in EvictionReason::ALL {
            cache_evictions.with_label_values(&[reason.as_str()]);
        }

        Ok(Self {
            registry,
            circuit_state,
            circuit_consecutive_failures,
            connection_consecutive_errors,
            connection_health_score,
            quota_usage_percent,
            cache_hits,
            cache_misses,
            cache_evictions,
            dedup_saved_calls,
            state_store_degraded,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Listener to hand to the gateway builder
    pub fn eviction_listener(&self) -> EvictionListener<CacheKey> {
        let evictions = self.cache_evictions.clone();
        Arc::new(move |_key: &CacheKey, reason: EvictionReason| {
            evictions.with_label_values(&[reason.as_str()]).inc();
        })
    }

    /// Copy every gauge from `snapshot`
    pub fn update_from(&self, snapshot: &GatewaySnapshot) {
        for circuit in &snapshot.circuits {
            self.circuit_state
                .with_label_values(&[circuit.name.as_str()])
                .set(circuit.state.as_gauge());
            self.circuit_consecutive_failures
                .with_label_values(&[circuit.name.as_str()])
                .set(saturating_i64(circuit.consecutive_failures));
        }

        for pool in &snapshot.connections {
            self.connection_consecutive_errors
                .with_label_values(&[pool.pool_name.as_str()])
                .set(i64::from(pool.consecutive_errors));
            self.connection_health_score
                .with_label_values(&[pool.pool_name.as_str()])
                .set(i64::from(pool.health_score));
        }

        for usage in &snapshot.usage {
            for entry in &usage.entries {
                self.quota_usage_percent
                    .with_label_values(&[
                        usage.tenant_id.as_str(),
                        entry.operation_class.as_str(),
                        entry.window.as_str(),
                    ])
                    .set(entry.percent_used);
            }
        }

        advance_to(&self.cache_hits, snapshot.cache.hits);
        advance_to(&self.cache_misses, snapshot.cache.misses);
        advance_to(&self.dedup_saved_calls, snapshot.dedup.joined);
        self.state_store_degraded.set(i64::from(snapshot.store.degraded));
    }

    /// Text exposition format
    pub fn render(&self) -> MetricsResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

/// Counters only move forward; a smaller total (cache cleared, process
/// restarted behind the same exporter) is ignored.
fn advance_to(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
