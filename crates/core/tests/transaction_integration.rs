//! Transactions through the gateway facade

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sheetgate_common::MockClock;
use sheetgate_core::testing::{ScriptedSpreadsheetApi, READ_STATE};
use sheetgate_core::{Gateway, InMemoryStateStore, UpstreamError};
use sheetgate_domain::{
    ErrorCode, ExpectedState, GatewayConfig, GatewayError, Operation, OperationStatus,
    TransactionStatus,
};

fn gateway(api: Arc<ScriptedSpreadsheetApi>, config: GatewayConfig) -> (Gateway, MockClock) {
    let clock = MockClock::at_millis(1_800_000_000_000);
    let gateway = Gateway::builder(api, Arc::new(InMemoryStateStore::new()))
        .config(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .expect("gateway");
    (gateway, clock)
}

fn fast_retry() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.retry.max_attempts = 2;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config
}

fn write(range: &str, values: Value) -> Operation {
    Operation::new(
        "sheets_data",
        "write",
        json!({ "spreadsheetId": "s1", "range": range, "values": values }),
    )
}

/// Validates a conflict in the middle of a three-write transaction.
///
/// Assertions:
/// - Confirms operation 1 is compensated and its range restored.
/// - Confirms operation 2 is reported as a conflict and operation 3 was
///   never attempted.
/// - Confirms code CONFLICT with status ROLLED_BACK.
#[tokio::test]
async fn test_conflict_rolls_back_earlier_writes() {
    let api = Arc::new(
        ScriptedSpreadsheetApi::new()
            .with_range("s1", "A1", json!([["a-before"]]))
            .with_range("s1", "B1", json!([["changed-by-someone-else"]])),
    );
    let (gateway, _clock) = gateway(api.clone(), fast_retry());

    let tx = gateway.begin("tenant-a").expect("begin");
    gateway.queue(tx, write("A1", json!([["a-after"]]))).expect("queue 1");
    gateway
        .queue(
            tx,
            write("B1", json!([["b-after"]]))
                .with_expected_state(ExpectedState::values(json!([["b-before"]]))),
        )
        .expect("queue 2");
    gateway.queue(tx, write("C1", json!([["c-after"]]))).expect("queue 3");

    let err = gateway.commit(tx).await.expect_err("conflict");
    assert_eq!(err.code(), ErrorCode::Conflict);
    assert!(!err.is_retryable());

    let payload = err.to_payload();
    assert_eq!(payload.details.transaction_id, Some(tx.to_string()));
    assert_eq!(payload.details.operation_index, Some(1));
    let statuses: Vec<OperationStatus> =
        payload.details.operations.expect("operations").iter().map(|op| op.status).collect();
    assert_eq!(
        statuses,
        vec![OperationStatus::Compensated, OperationStatus::Conflict, OperationStatus::NotAttempted]
    );

    assert_eq!(api.range_values("s1", "A1"), json!([["a-before"]]));
    assert_eq!(api.range_values("s1", "B1"), json!([["changed-by-someone-else"]]));
    assert_eq!(api.range_values("s1", "C1"), json!([]));

    let summary = gateway.status(tx).expect("status");
    assert_eq!(summary.status, TransactionStatus::RolledBack);
    assert!(!summary.committing);
    assert!(summary.completed_at.is_some());
}

/// Validates compensation failure handling.
///
/// Assertions:
/// - Confirms a failed compensation leaves the transaction FAILED.
/// - Confirms PARTIAL_FAILURE lists the operation needing attention.
#[tokio::test]
async fn test_compensation_failure_marks_transaction_failed() {
    let api = Arc::new(ScriptedSpreadsheetApi::new());
    let (gateway, _clock) = gateway(api.clone(), fast_retry());
    api.fail_always("sheets_data.write", UpstreamError::from_status(400, "bad request"));
    api.fail_always("sheets_core.delete_sheet", UpstreamError::from_status(403, "read-only now"));

    let args = json!({ "spreadsheetId": "s1", "title": "Q4" });
    let add_sheet = Operation::new("sheets_core", "add_sheet", args.clone())
        .with_compensation(Operation::new("sheets_core", "delete_sheet", args));
    let tx = gateway.begin("tenant-a").expect("begin");
    gateway.queue(tx, add_sheet).expect("queue 1");
    gateway.queue(tx, write("A1", json!([["after"]]))).expect("queue 2");

    let err = gateway.commit(tx).await.expect_err("aborted");
    assert_eq!(err.code(), ErrorCode::PartialFailure);
    assert!(!err.is_retryable());
    let GatewayError::TransactionAborted { status, operations, failed_index, .. } = &err else {
        panic!("unexpected error {err:?}");
    };
    assert_eq!(*status, TransactionStatus::Failed);
    assert_eq!(*failed_index, Some(1));
    assert_eq!(operations[0].status, OperationStatus::CompensationFailed);
    assert!(operations[0].error.is_some());
    assert_eq!(operations[1].status, OperationStatus::Failed);
    assert_eq!(api.call_count("sheets_core.delete_sheet"), 1);
    assert_eq!(gateway.status(tx).expect("status").status, TransactionStatus::Failed);
}

/// Validates that a commit keeps running when its caller goes away.
///
/// Assertions:
/// - Confirms an aborted caller does not stop the commit.
/// - Ensures the transaction still reaches COMMITTED.
#[tokio::test]
async fn test_commit_survives_dropped_caller() {
    let api = Arc::new(ScriptedSpreadsheetApi::new());
    api.set_latency("sheets_data.write", Duration::from_millis(20));
    let (gateway, _clock) = gateway(api.clone(), fast_retry());

    let tx = gateway.begin("tenant-a").expect("begin");
    gateway.queue(tx, write("A1", json!([[1]]))).expect("queue");
    gateway.queue(tx, write("B1", json!([[2]]))).expect("queue");

    let caller = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.commit(tx).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    caller.abort();

    assert!(gateway.status(tx).expect("status").committing);
    assert!(matches!(gateway.rollback(tx), Err(GatewayError::InvalidState { .. })));

    for _ in 0..50 {
        if gateway.status(tx).expect("status").status == TransactionStatus::Committed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(gateway.status(tx).expect("status").status, TransactionStatus::Committed);
    assert_eq!(api.range_values("s1", "B1"), json!([[2]]));
}

/// Validates that transient errors inside a transaction are retried.
///
/// Assertions:
/// - Confirms a single 503 does not abort the transaction.
#[tokio::test]
async fn test_transient_error_retried_within_commit() {
    let api = Arc::new(ScriptedSpreadsheetApi::new());
    let (gateway, _clock) = gateway(api.clone(), fast_retry());
    api.fail_next("sheets_data.write", UpstreamError::from_status(503, "busy"));

    let tx = gateway.begin("tenant-a").expect("begin");
    gateway.queue(tx, write("A1", json!([[1]]))).expect("queue");
    let report = gateway.commit(tx).await.expect("commit");

    assert_eq!(report.status, TransactionStatus::Committed);
    assert_eq!(api.call_count("sheets_data.write"), 2);
    assert_eq!(api.call_count(READ_STATE), 1);
}

/// Validates expiry and purging of idle transactions.
///
/// Assertions:
/// - Confirms an idle transaction is rolled back and later forgotten.
#[tokio::test]
async fn test_idle_transactions_expire() {
    let api = Arc::new(ScriptedSpreadsheetApi::new());
    let mut config = GatewayConfig::default();
    config.transactions.inactivity_timeout_ms = 1_000;
    config.transactions.retention_ms = 1_000;
    let (gateway, clock) = gateway(api.clone(), config);

    let tx = gateway.begin("tenant-a").expect("begin");
    gateway.queue(tx, write("A1", json!([[1]]))).expect("queue");
    clock.advance(Duration::from_secs(2));

    assert_eq!(gateway.purge_expired(), 0);
    assert_eq!(gateway.status(tx).expect("status").status, TransactionStatus::RolledBack);
    let err = gateway.commit(tx).await.expect_err("expired");
    assert_eq!(err.code(), ErrorCode::InvalidState);

    clock.advance(Duration::from_secs(2));
    assert_eq!(gateway.purge_expired(), 1);
    assert!(gateway.list_transactions(Some("tenant-a")).is_empty());
    assert_eq!(api.total_calls(), 0);
}
