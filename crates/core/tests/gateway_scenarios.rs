//! End-to-end behaviour of the gateway facade over the scripted upstream

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::join_all;
use serde_json::{json, Value};
use sheetgate_common::{CircuitState, MockClock};
use sheetgate_core::testing::ScriptedSpreadsheetApi;
use sheetgate_core::{Gateway, InMemoryStateStore, UpstreamError};
use sheetgate_domain::{
    ErrorCode, GatewayConfig, Operation, OperationClass, QuotaLimits, QuotaPolicy, QuotaWindow,
};

struct Fixture {
    gateway: Gateway,
    api: Arc<ScriptedSpreadsheetApi>,
    clock: MockClock,
}

fn fixture(config: GatewayConfig) -> Fixture {
    let start = Utc.with_ymd_and_hms(2026, 3, 14, 13, 20, 0).single().expect("valid time");
    let clock = MockClock::at(start);
    let api = Arc::new(
        ScriptedSpreadsheetApi::new().with_range("s1", "A1:B2", json!([[1, 2], [3, 4]])),
    );
    let gateway = Gateway::builder(api.clone(), Arc::new(InMemoryStateStore::new()))
        .config(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .expect("gateway");
    Fixture { gateway, api, clock }
}

fn read(range: &str) -> Operation {
    Operation::new("sheets_data", "read", json!({ "spreadsheetId": "s1", "range": range }))
}

fn write(range: &str, values: Value) -> Operation {
    Operation::new(
        "sheets_data",
        "write",
        json!({ "spreadsheetId": "s1", "range": range, "values": values }),
    )
}

/// Validates the hourly read quota.
///
/// Assertions:
/// - Confirms two reads are admitted and the third is RATE_LIMITED.
/// - Confirms resetTime is the next hour boundary and the rejected read
///   never reaches upstream.
#[tokio::test]
async fn test_hourly_read_limit() {
    let mut limits = QuotaLimits::default();
    limits.read.hourly = Some(2);
    let mut config = GatewayConfig::default();
    config.quota = QuotaPolicy::default().with_tenant("tenant-a", limits);
    let fx = fixture(config);

    fx.gateway.execute("tenant-a", read("A1")).await.expect("first read");
    fx.gateway.execute("tenant-a", read("A2")).await.expect("second read");
    let err = fx.gateway.execute("tenant-a", read("A3")).await.expect_err("third read");

    let payload = err.to_payload();
    assert_eq!(payload.code, ErrorCode::RateLimited);
    assert!(payload.retryable);
    assert_eq!(payload.details.quota_type.as_deref(), Some("read:hourly"));
    assert_eq!(payload.details.reset_time, Utc.with_ymd_and_hms(2026, 3, 14, 14, 0, 0).single());
    assert_eq!(fx.api.call_count("sheets_data.read"), 2);

    // other tenants keep their own counters
    fx.gateway.execute("tenant-b", read("A3")).await.expect("other tenant");

    let usage = fx.gateway.get_usage_stats("tenant-a").await.expect("usage");
    let hourly = usage.entry(OperationClass::Read, QuotaWindow::Hourly).expect("hourly entry");
    assert_eq!(hourly.count, 2);
    assert_eq!(hourly.limit, Some(2));

    fx.clock.advance(Duration::from_secs(40 * 60));
    fx.gateway.execute("tenant-a", read("A3")).await.expect("new hour");
}

/// Validates breaker opening, fail-fast and the half-open trial.
///
/// Assertions:
/// - Confirms three failures open the circuit.
/// - Confirms a call at t+10s fails fast without an upstream call.
/// - Confirms a call at t+31s is let through and closes the circuit.
#[tokio::test]
async fn test_breaker_opens_and_recovers() {
    let mut config = GatewayConfig::default();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.timeout_ms = 30_000;
    config.retry.max_attempts = 1;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 1;
    let fx = fixture(config);
    fx.api.fail_always("sheets_data.write", UpstreamError::from_status(503, "backend unavailable"));

    for attempt in 0..3 {
        let operation = write("A1", json!([[attempt]]));
        let err = fx.gateway.execute("t1", operation).await.expect_err("upstream down");
        assert_eq!(err.code(), ErrorCode::UpstreamError);
    }
    let status = fx.gateway.get_circuit_state("sheets").await.expect("state");
    assert_eq!(status.state, CircuitState::Open);
    assert_eq!(status.consecutive_failures, 3);

    fx.clock.advance(Duration::from_secs(10));
    let err = fx.gateway.execute("t1", write("A1", json!([[9]]))).await.expect_err("fail fast");
    let payload = err.to_payload();
    assert_eq!(payload.code, ErrorCode::RateLimited);
    assert_eq!(payload.details.circuit_breaker_state.as_deref(), Some("OPEN"));
    assert_eq!(payload.details.retry_after_ms, Some(20_000));
    assert_eq!(fx.api.call_count("sheets_data.write"), 3);

    fx.clock.advance(Duration::from_secs(21));
    fx.api.clear_failures("sheets_data.write");
    fx.gateway.execute("t1", write("A1", json!([[10]]))).await.expect("trial call");
    assert_eq!(fx.api.call_count("sheets_data.write"), 4);
    let circuit = fx.gateway.get_circuit_state("sheets").await.expect("state");
    assert_eq!(circuit.state, CircuitState::Closed);
}

/// Validates deduplication of concurrent identical requests.
///
/// Assertions:
/// - Confirms N concurrent callers cause one upstream call.
/// - Confirms every caller receives the same result.
#[tokio::test]
async fn test_concurrent_identical_reads_share_one_call() {
    let fx = fixture(GatewayConfig::default());
    fx.api.set_latency("sheets_data.read", Duration::from_millis(50));

    let calls = (0..8).map(|_| {
        let gateway = fx.gateway.clone();
        tokio::spawn(async move { gateway.execute("t1", read("A1:B2")).await })
    });
    let results: Vec<Value> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.expect("task").expect("read"))
        .collect();

    assert_eq!(fx.api.call_count("sheets_data.read"), 1);
    assert!(results.iter().all(|value| value == &results[0]));
    assert_eq!(results[0]["values"], json!([[1, 2], [3, 4]]));
    let stats = fx.gateway.get_dedup_stats();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.joined, 7);
}

/// Validates cached reads, TTL expiry and write invalidation.
///
/// Assertions:
/// - Confirms a repeat read is served from cache.
/// - Confirms a write to the spreadsheet makes the next read go upstream.
/// - Confirms entries expire after the TTL.
#[tokio::test]
async fn test_cache_ttl_and_write_invalidation() {
    let fx = fixture(GatewayConfig::default());

    fx.gateway.execute("t1", read("A1:B2")).await.expect("read");
    fx.gateway.execute("t1", read("A1:B2")).await.expect("cached");
    assert_eq!(fx.api.call_count("sheets_data.read"), 1);
    assert_eq!(fx.gateway.get_cache_stats().hits, 1);

    fx.gateway.execute("t1", write("A1:B2", json!([[5, 6], [7, 8]]))).await.expect("write");
    let fresh = fx.gateway.execute("t1", read("A1:B2")).await.expect("fresh read");
    assert_eq!(fresh["values"], json!([[5, 6], [7, 8]]));
    assert_eq!(fx.api.call_count("sheets_data.read"), 2);

    fx.clock.advance(Duration::from_secs(61));
    fx.gateway.execute("t1", read("A1:B2")).await.expect("expired");
    assert_eq!(fx.api.call_count("sheets_data.read"), 3);
}

/// Validates that authentication failures are surfaced without retry.
///
/// Assertions:
/// - Confirms AUTHENTICATION_FAILED after exactly one upstream call.
/// - Ensures the circuit stays closed.
#[tokio::test]
async fn test_auth_failure_surfaces_immediately() {
    let fx = fixture(GatewayConfig::default());
    fx.api.fail_always("sheets_data.read", UpstreamError::from_status(401, "token expired"));

    for _ in 0..6 {
        let err = fx.gateway.execute("t1", read("A1")).await.expect_err("unauthenticated");
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    }
    assert_eq!(fx.api.call_count("sheets_data.read"), 6);
    let circuit = fx.gateway.get_circuit_state("sheets").await.expect("state");
    assert_eq!(circuit.state, CircuitState::Closed);
}
