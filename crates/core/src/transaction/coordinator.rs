//! Transaction coordinator
//!
//! Groups operations into a unit that either applies completely or is
//! compensated. There is no atomicity upstream, so "rolled back" means every
//! applied operation was undone by a compensating call, in reverse order.
//! When a compensation itself fails the transaction ends FAILED and the
//! per-operation report says what still needs manual attention.
//!
//! Ranges touched by concurrent transactions are not locked; the only
//! conflict defence is each operation's expected state.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sheetgate_domain::constants::{
    COMPENSATION_CLEAR_ACTION, COMPENSATION_TOOL, COMPENSATION_WRITE_ACTION,
};
use sheetgate_domain::{
    classify, CommitReport, GatewayError, Operation, OperationReport, OperationStatus, StateTarget,
    TransactionId, TransactionSettings, TransactionStatus, TransactionSummary,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::pipeline::ExecutionPipeline;
use crate::SharedClock;

/// How an applied operation is undone
#[derive(Debug, Clone)]
enum Compensation {
    /// Caller-supplied inverse
    Explicit(Operation),
    /// Clear the range, then write the captured prior values back
    Restore { target: StateTarget, prior: Value },
    /// Clear the rows an append inserted
    ClearAppended { target: StateTarget },
    /// Reads change nothing
    NotNeeded,
    Irreversible,
}

#[derive(Debug)]
struct TransactionRecord {
    id: TransactionId,
    tenant_id: String,
    status: TransactionStatus,
    committing: bool,
    operations: Vec<Operation>,
    reports: Vec<OperationReport>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    committed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TransactionRecord {
    fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.id,
            tenant_id: self.tenant_id.clone(),
            status: self.status,
            committing: self.committing,
            operation_count: self.operations.len(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            committed_at: self.committed_at,
            completed_at: self.completed_at,
            operations: self.reports.clone(),
        }
    }

    fn ensure_open(&self, verb: &str) -> Result<(), GatewayError> {
        if self.committing {
            return Err(GatewayError::invalid_state(format!(
                "cannot {verb} transaction {}: commit in progress",
                self.id
            )));
        }
        if self.status != TransactionStatus::Pending {
            return Err(GatewayError::invalid_state(format!(
                "cannot {verb} transaction {}: status is {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn finish(&mut self, status: TransactionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.committing = false;
        self.completed_at = Some(now);
        self.last_activity_at = now;
    }

    fn discard_queued(&mut self) {
        for report in &mut self.reports {
            if report.status == OperationStatus::Queued {
                report.status = OperationStatus::NotAttempted;
            }
        }
    }
}

struct Inner {
    pipeline: ExecutionPipeline,
    transactions: DashMap<TransactionId, Arc<Mutex<TransactionRecord>>>,
    settings: TransactionSettings,
    clock: SharedClock,
}

/// Owns every transaction; callers hold only ids
#[derive(Clone)]
pub struct TransactionCoordinator {
    inner: Arc<Inner>,
}

impl TransactionCoordinator {
    pub fn new(
        pipeline: ExecutionPipeline,
        settings: TransactionSettings,
        clock: SharedClock,
    ) -> Self {
        Self { inner: Arc::new(Inner { pipeline, transactions: DashMap::new(), settings, clock }) }
    }

    pub fn settings(&self) -> &TransactionSettings {
        &self.inner.settings
    }

    /// Open a PENDING transaction for `tenant_id`
    pub fn begin(&self, tenant_id: &str) -> Result<TransactionId, GatewayError> {
        if tenant_id.trim().is_empty() {
            return Err(GatewayError::invalid_input("tenant id must not be empty"));
        }
        let now = self.inner.clock.utc_now();
        let id = TransactionId::new();
        let record = TransactionRecord {
            id,
            tenant_id: tenant_id.to_string(),
            status: TransactionStatus::Pending,
            committing: false,
            operations: Vec::new(),
            reports: Vec::new(),
            created_at: now,
            last_activity_at: now,
            committed_at: None,
            completed_at: None,
        };
        self.inner.transactions.insert(id, Arc::new(Mutex::new(record)));
        info!(transaction_id = %id, tenant_id, "transaction started");
        Ok(id)
    }

    /// Append an operation; returns its 0-based position
    pub fn queue(&self, id: TransactionId, operation: Operation) -> Result<usize, GatewayError> {
        let record = self.inner.record(id)?;
        let mut tx = record.lock();
        let now = self.inner.clock.utc_now();
        self.inner.expire_if_idle(&mut tx, now);
        tx.ensure_open("queue into")?;

        if tx.operations.len() >= self.inner.settings.max_operations {
            return Err(GatewayError::invalid_input(format!(
                "transaction {id} already holds the maximum of {} operations",
                self.inner.settings.max_operations
            )));
        }
        let index = tx.operations.len();
        tx.reports.push(OperationReport::new(
            index,
            operation.tool(),
            operation.action(),
            OperationStatus::Queued,
        ));
        debug!(
            transaction_id = %id,
            index,
            operation = %operation.qualified_name(),
            "operation queued"
        );
        tx.operations.push(operation);
        tx.last_activity_at = now;
        Ok(index)
    }

    /// Apply every queued operation in order
    ///
    /// Runs as its own task: dropping the returned future does not stop a
    /// commit that has started.
    #[instrument(skip(self), fields(transaction_id = %id))]
    pub async fn commit(&self, id: TransactionId) -> Result<CommitReport, GatewayError> {
        let record = self.inner.record(id)?;
        let (tenant_id, operations) = {
            let mut tx = record.lock();
            let now = self.inner.clock.utc_now();
            self.inner.expire_if_idle(&mut tx, now);
            tx.ensure_open("commit")?;
            tx.committing = true;
            tx.last_activity_at = now;
            (tx.tenant_id.clone(), tx.operations.clone())
        };
        info!(tenant_id = %tenant_id, operations = operations.len(), "committing transaction");

        let inner = Arc::clone(&self.inner);
        let task_record = Arc::clone(&record);
        let handle = tokio::spawn(async move {
            inner.run_commit(id, &task_record, &tenant_id, &operations).await
        });
        match handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                let mut tx = record.lock();
                tx.finish(TransactionStatus::Failed, self.inner.clock.utc_now());
                warn!(error = %err, "commit task aborted; transaction marked FAILED");
                Err(GatewayError::internal(format!("commit of transaction {id} aborted: {err}")))
            }
        }
    }

    /// Discard a PENDING transaction
    ///
    /// Rolling back an already rolled back transaction returns its summary
    /// again; committed or failed transactions cannot be rolled back.
    pub fn rollback(&self, id: TransactionId) -> Result<TransactionSummary, GatewayError> {
        let record = self.inner.record(id)?;
        let mut tx = record.lock();
        let now = self.inner.clock.utc_now();
        self.inner.expire_if_idle(&mut tx, now);

        match tx.status {
            TransactionStatus::RolledBack => Ok(tx.summary()),
            TransactionStatus::Pending => {
                tx.ensure_open("roll back")?;
                tx.discard_queued();
                tx.finish(TransactionStatus::RolledBack, now);
                info!(
                    transaction_id = %id,
                    discarded = tx.operations.len(),
                    "transaction rolled back"
                );
                Ok(tx.summary())
            }
            status => {
                Err(GatewayError::invalid_state(format!(
                    "cannot roll back transaction {id}: status is {status}"
                )))
            }
        }
    }

    pub fn status(&self, id: TransactionId) -> Result<TransactionSummary, GatewayError> {
        let record = self.inner.record(id)?;
        let mut tx = record.lock();
        self.inner.expire_if_idle(&mut tx, self.inner.clock.utc_now());
        Ok(tx.summary())
    }

    /// Known transactions in creation order, optionally for one tenant
    pub fn list(&self, tenant_id: Option<&str>) -> Vec<TransactionSummary> {
        let records: Vec<Arc<Mutex<TransactionRecord>>> =
            self.inner.transactions.iter().map(|entry| Arc::clone(entry.value())).collect();
        let now = self.inner.clock.utc_now();
        let mut summaries: Vec<TransactionSummary> = records
            .iter()
            .filter_map(|record| {
                let mut tx = record.lock();
                if tenant_id.is_some_and(|tenant| tenant != tx.tenant_id) {
                    return None;
                }
                self.inner.expire_if_idle(&mut tx, now);
                Some(tx.summary())
            })
            .collect();
        summaries.sort_by_key(|summary| summary.id);
        summaries
    }

    /// Expire idle transactions and drop terminal ones past retention
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until the
    /// coordinator is dropped
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("coordinator dropped; transaction reaper exiting");
                    break;
                };
                let purged = inner.purge_expired();
                if purged > 0 {
                    debug!(purged, "pruned expired transactions");
                }
            }
        })
    }
}

impl Inner {
    fn record(&self, id: TransactionId) -> Result<Arc<Mutex<TransactionRecord>>, GatewayError> {
        self.transactions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::TransactionNotFound { transaction_id: id.to_string() })
    }

    fn expire_if_idle(&self, tx: &mut TransactionRecord, now: DateTime<Utc>) {
        if tx.status != TransactionStatus::Pending || tx.committing {
            return;
        }
        let timeout = chrono::Duration::milliseconds(
            i64::try_from(self.settings.inactivity_timeout_ms).unwrap_or(i64::MAX),
        );
        if now - tx.last_activity_at >= timeout {
            tx.discard_queued();
            tx.finish(TransactionStatus::RolledBack, now);
            info!(
                transaction_id = %tx.id,
                tenant_id = %tx.tenant_id,
                "idle transaction expired and rolled back"
            );
        }
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.utc_now();
        let retention = chrono::Duration::milliseconds(
            i64::try_from(self.settings.retention_ms).unwrap_or(i64::MAX),
        );
        let before = self.transactions.len();
        self.transactions.retain(|_, record| {
            let mut tx = record.lock();
            self.expire_if_idle(&mut tx, now);
            let expired = tx.completed_at.is_some_and(|done| now - done >= retention);
            !(tx.status.is_terminal() && expired)
        });
        before.saturating_sub(self.transactions.len())
    }

    async fn run_commit(
        &self,
        id: TransactionId,
        record: &Mutex<TransactionRecord>,
        tenant_id: &str,
        operations: &[Operation],
    ) -> Result<CommitReport, GatewayError> {
        let mut reports: Vec<OperationReport> = operations
            .iter()
            .enumerate()
            .map(|(index, op)| {
                OperationReport::new(index, op.tool(), op.action(), OperationStatus::NotAttempted)
            })
            .collect();
        let mut applied: Vec<(usize, Compensation)> = Vec::with_capacity(operations.len());

        for (index, operation) in operations.iter().enumerate() {
            match self.apply(tenant_id, index, operation).await {
                Ok((value, compensation)) => {
                    reports[index].status = OperationStatus::Applied;
                    reports[index].result = Some(value);
                    applied.push((index, compensation));
                }
                Err(cause) => {
                    let conflict = matches!(cause, GatewayError::Conflict { .. });
                    reports[index].status =
                        if conflict { OperationStatus::Conflict } else { OperationStatus::Failed };
                    reports[index].error = Some(cause.to_payload());
                    warn!(
                        transaction_id = %id,
                        index,
                        operation = %operation.qualified_name(),
                        error = %cause,
                        "transaction operation failed; compensating"
                    );

                    let compensated =
                        self.compensate(id, tenant_id, operations, &applied, &mut reports).await;
                    let status = if compensated {
                        TransactionStatus::RolledBack
                    } else {
                        TransactionStatus::Failed
                    };
                    {
                        let mut tx = record.lock();
                        tx.reports = reports.clone();
                        tx.finish(status, self.clock.utc_now());
                    }
                    if status == TransactionStatus::Failed {
                        warn!(transaction_id = %id, "compensation incomplete; transaction FAILED");
                    }
                    return Err(GatewayError::TransactionAborted {
                        transaction_id: id.to_string(),
                        status,
                        failed_index: Some(index),
                        cause: Box::new(cause),
                        operations: reports,
                    });
                }
            }
        }

        let committed_at = self.clock.utc_now();
        {
            let mut tx = record.lock();
            tx.reports = reports.clone();
            tx.committed_at = Some(committed_at);
            tx.finish(TransactionStatus::Committed, committed_at);
        }
        info!(transaction_id = %id, operations = operations.len(), "transaction committed");
        Ok(CommitReport {
            transaction_id: id,
            status: TransactionStatus::Committed,
            operations: reports,
            committed_at,
        })
    }

    /// Plan the undo, check the expected state, then execute
    async fn apply(
        &self,
        tenant_id: &str,
        index: usize,
        operation: &Operation,
    ) -> Result<(Value, Compensation), GatewayError> {
        let profile = classify(operation.tool(), operation.action());
        let appends = operation.tool() == COMPENSATION_TOOL && operation.action() == "append";
        let compensation = if let Some(inverse) = operation.compensation() {
            Compensation::Explicit(inverse.clone())
        } else if profile.class.is_read_only() {
            Compensation::NotNeeded
        } else if appends {
            // resolved from the response once the rows exist
            Compensation::Irreversible
        } else if let Some(target) = restore_target(operation) {
            let prior = self.pipeline.read_state(tenant_id, &target).await?;
            Compensation::Restore { target, prior }
        } else {
            Compensation::Irreversible
        };

        if let Some(expected) = operation.expected_state() {
            let target = operation.state_target().ok_or_else(|| {
                GatewayError::invalid_input(format!(
                    "operation {index} carries an expected state but names no spreadsheetId \
                     and range"
                ))
            })?;
            let current = match &compensation {
                Compensation::Restore { target: captured, prior } if *captured == target => {
                    prior.clone()
                }
                _ => self.pipeline.read_state(tenant_id, &target).await?,
            };
            if !expected.matches(&current) {
                return Err(GatewayError::Conflict {
                    spreadsheet_id: target.spreadsheet_id,
                    range: target.range,
                    operation_index: Some(index),
                });
            }
        }

        let value = self.pipeline.execute_verified(tenant_id, operation).await?;
        let compensation = match compensation {
            Compensation::Irreversible if appends => appended_target(operation, &value)
                .map_or(Compensation::Irreversible, |target| {
                    Compensation::ClearAppended { target }
                }),
            planned => planned,
        };
        Ok((value, compensation))
    }

    /// Undo `applied` newest first; false if anything could not be undone
    async fn compensate(
        &self,
        id: TransactionId,
        tenant_id: &str,
        operations: &[Operation],
        applied: &[(usize, Compensation)],
        reports: &mut [OperationReport],
    ) -> bool {
        let mut complete = true;
        for (index, compensation) in applied.iter().rev() {
            let outcome = match compensation {
                Compensation::NotNeeded => Ok(()),
                Compensation::Explicit(inverse) => {
                    self.pipeline.execute_compensation(tenant_id, inverse).await.map(drop)
                }
                Compensation::Restore { target, prior } => {
                    self.restore(tenant_id, target, prior).await
                }
                Compensation::ClearAppended { target } => self.clear(tenant_id, target).await,
                Compensation::Irreversible => Err(GatewayError::invalid_state(format!(
                    "{} has no compensation and cannot be undone automatically",
                    operations[*index].qualified_name()
                ))),
            };
            match outcome {
                Ok(()) => reports[*index].status = OperationStatus::Compensated,
                Err(err) => {
                    warn!(transaction_id = %id, index, error = %err, "compensation failed");
                    reports[*index].status = OperationStatus::CompensationFailed;
                    reports[*index].error = Some(err.to_payload());
                    complete = false;
                }
            }
        }
        complete
    }

    /// A values write only replaces the cells it carries, so the range is
    /// emptied before the prior values go back
    async fn restore(
        &self,
        tenant_id: &str,
        target: &StateTarget,
        prior: &Value,
    ) -> Result<(), GatewayError> {
        self.clear(tenant_id, target).await?;
        if prior.as_array().is_some_and(|rows| !rows.is_empty()) {
            let write = Operation::new(
                COMPENSATION_TOOL,
                COMPENSATION_WRITE_ACTION,
                json!({
                    "spreadsheetId": target.spreadsheet_id,
                    "range": target.range,
                    "values": prior,
                }),
            );
            self.pipeline.execute_compensation(tenant_id, &write).await?;
        }
        Ok(())
    }

    async fn clear(&self, tenant_id: &str, target: &StateTarget) -> Result<(), GatewayError> {
        let clear = Operation::new(
            COMPENSATION_TOOL,
            COMPENSATION_CLEAR_ACTION,
            json!({ "spreadsheetId": target.spreadsheet_id, "range": target.range }),
        );
        self.pipeline.execute_compensation(tenant_id, &clear).await.map(drop)
    }
}

/// Range whose prior values make a restore possible
fn restore_target(operation: &Operation) -> Option<StateTarget> {
    Some(StateTarget {
        spreadsheet_id: operation.spreadsheet_id()?.to_string(),
        range: operation.range()?.to_string(),
    })
}

/// Range an append wrote to, as reported by the upstream
fn appended_target(operation: &Operation, response: &Value) -> Option<StateTarget> {
    let range = response.pointer("/updates/updatedRange").and_then(Value::as_str)?;
    Some(StateTarget {
        spreadsheet_id: operation.spreadsheet_id()?.to_string(),
        range: range.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use sheetgate_common::{CircuitBreakerConfig, MockClock};
    use sheetgate_domain::{
        CacheSettings, ErrorCode, ExpectedState, HealthSettings, QuotaPolicy, RetrySettings,
    };

    use super::*;
    use crate::circuit::CircuitRegistry;
    use crate::dedup::{RequestDeduplicator, ResultCache};
    use crate::health::ConnectionHealthMonitor;
    use crate::quota::QuotaLedger;
    use crate::state::InMemoryStateStore;
    use crate::testing::ScriptedSpreadsheetApi;
    use crate::upstream::UpstreamError;

    fn coordinator(api: Arc<ScriptedSpreadsheetApi>) -> (TransactionCoordinator, MockClock) {
        let clock = MockClock::at_millis(1_800_000_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(InMemoryStateStore::new());
        let pipeline = ExecutionPipeline::new(
            api,
            Arc::new(QuotaLedger::new(store.clone(), QuotaPolicy::default(), shared.clone())),
            Arc::new(CircuitRegistry::new(store, CircuitBreakerConfig::default(), shared.clone())),
            Arc::new(ConnectionHealthMonitor::new(HealthSettings::default(), shared.clone())),
            Arc::new(ResultCache::new(&CacheSettings::default(), shared.clone())),
            Arc::new(RequestDeduplicator::new()),
            &RetrySettings { max_attempts: 1, initial_delay_ms: 1, max_delay_ms: 1 },
        );
        (TransactionCoordinator::new(pipeline, TransactionSettings::default(), shared), clock)
    }

    fn write(range: &str, values: Value) -> Operation {
        Operation::new(
            "sheets_data",
            "write",
            json!({ "spreadsheetId": "s1", "range": range, "values": values }),
        )
    }

    fn set_borders() -> Operation {
        Operation::new("sheets_format", "set_borders", json!({ "spreadsheetId": "s1" }))
    }

    /// Validates a fully successful commit.
    ///
    /// Assertions:
    /// - Confirms COMMITTED with results in enqueue order.
    /// - Ensures queue after commit is rejected.
    #[tokio::test]
    async fn test_commit_applies_in_order() {
        let api = Arc::new(ScriptedSpreadsheetApi::new());
        let (coordinator, _clock) = coordinator(api.clone());
        let tx = coordinator.begin("t1").expect("begin");
        assert_eq!(coordinator.queue(tx, write("A1", json!([[1]]))).expect("queue"), 0);
        assert_eq!(coordinator.queue(tx, write("B1", json!([[2]]))).expect("queue"), 1);

        let report = coordinator.commit(tx).await.expect("commit");
        assert_eq!(report.status, TransactionStatus::Committed);
        assert_eq!(report.results().len(), 2);
        assert_eq!(api.range_values("s1", "B1"), json!([[2]]));

        let err = coordinator.queue(tx, write("C1", json!([[3]]))).expect_err("closed");
        assert_eq!(err.code(), ErrorCode::InvalidState);
        assert!(coordinator.rollback(tx).is_err());
    }

    /// Validates restore-based compensation after a failure.
    ///
    /// Assertions:
    /// - Confirms the earlier write is undone and the later one never attempted.
    /// - Confirms PARTIAL_FAILURE with status ROLLED_BACK.
    #[tokio::test]
    async fn test_failure_compensates_earlier_operations() {
        let api = Arc::new(ScriptedSpreadsheetApi::new().with_range("s1", "A1", json!([["old"]])));
        let (coordinator, _clock) = coordinator(api.clone());
        let tx = coordinator.begin("t1").expect("begin");
        coordinator.queue(tx, write("A1", json!([["new"]]))).expect("queue");
        coordinator.queue(tx, set_borders()).expect("queue");
        coordinator.queue(tx, write("C1", json!([[3]]))).expect("queue");
        api.fail_always(
            "sheets_format.set_borders",
            UpstreamError::from_status(400, "bad borders"),
        );

        let err = coordinator.commit(tx).await.expect_err("aborted");
        assert_eq!(err.code(), ErrorCode::PartialFailure);
        let GatewayError::TransactionAborted { status, operations, failed_index, .. } = &err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(*status, TransactionStatus::RolledBack);
        assert_eq!(*failed_index, Some(1));
        let statuses: Vec<OperationStatus> = operations.iter().map(|op| op.status).collect();
        assert_eq!(
            statuses,
            vec![
                OperationStatus::Compensated,
                OperationStatus::Failed,
                OperationStatus::NotAttempted,
            ]
        );
        assert_eq!(api.range_values("s1", "A1"), json!([["old"]]));
        assert_eq!(api.call_count("sheets_data.write"), 2);
    }

    /// Validates restoring a range that was empty before the transaction.
    ///
    /// Assertions:
    /// - Confirms the written cells are cleared, not overwritten with `[]`.
    /// - Confirms no restore write is sent when there was nothing to restore.
    #[tokio::test]
    async fn test_restore_into_empty_range_clears_written_cells() {
        let api = Arc::new(ScriptedSpreadsheetApi::new());
        let (coordinator, _clock) = coordinator(api.clone());
        let tx = coordinator.begin("t1").expect("begin");
        coordinator.queue(tx, write("A1:B2", json!([[1, 2], [3, 4]]))).expect("queue");
        coordinator
            .queue(tx, set_borders())
            .expect("queue");
        api.fail_always(
            "sheets_format.set_borders",
            UpstreamError::from_status(400, "bad borders"),
        );

        let err = coordinator.commit(tx).await.expect_err("aborted");
        let GatewayError::TransactionAborted { status, operations, .. } = &err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(*status, TransactionStatus::RolledBack);
        assert_eq!(operations[0].status, OperationStatus::Compensated);
        assert_eq!(api.range_values("s1", "A1:B2"), json!([]));
        assert_eq!(api.call_count("sheets_data.clear"), 1);
        assert_eq!(api.call_count("sheets_data.write"), 1);
    }

    /// Validates restoring a range the forward write only partly covered.
    ///
    /// Assertions:
    /// - Confirms cells that were empty before end up empty again.
    #[tokio::test]
    async fn test_restore_removes_cells_beyond_prior_values() {
        let api = Arc::new(ScriptedSpreadsheetApi::new().with_range("s1", "A1", json!([["keep"]])));
        let (coordinator, _clock) = coordinator(api.clone());
        let tx = coordinator.begin("t1").expect("begin");
        coordinator.queue(tx, write("A1:B2", json!([["x", "y"], ["z", "w"]]))).expect("queue");
        coordinator
            .queue(tx, set_borders())
            .expect("queue");
        api.fail_always(
            "sheets_format.set_borders",
            UpstreamError::from_status(400, "bad borders"),
        );

        let err = coordinator.commit(tx).await.expect_err("aborted");
        assert_eq!(err.code(), ErrorCode::PartialFailure);
        assert_eq!(api.range_values("s1", "A1:B2"), json!([["keep"]]));
        assert_eq!(coordinator.status(tx).expect("status").status, TransactionStatus::RolledBack);
    }

    /// Validates undoing an append.
    ///
    /// Assertions:
    /// - Confirms the inserted rows are cleared using the reported range.
    /// - Confirms the rows that were there before are untouched.
    #[tokio::test]
    async fn test_append_is_undone_by_clearing_inserted_rows() {
        let api = Arc::new(
            ScriptedSpreadsheetApi::new().with_range("s1", "A1:B1", json!([["h1", "h2"]])),
        );
        let (coordinator, _clock) = coordinator(api.clone());
        let tx = coordinator.begin("t1").expect("begin");
        let append = Operation::new(
            "sheets_data",
            "append",
            json!({ "spreadsheetId": "s1", "range": "A1:B", "values": [[1, 2], [3, 4]] }),
        );
        coordinator.queue(tx, append).expect("queue");
        coordinator
            .queue(tx, set_borders())
            .expect("queue");
        api.fail_always(
            "sheets_format.set_borders",
            UpstreamError::from_status(400, "bad borders"),
        );

        let err = coordinator.commit(tx).await.expect_err("aborted");
        let GatewayError::TransactionAborted { status, operations, .. } = &err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(*status, TransactionStatus::RolledBack);
        assert_eq!(operations[0].status, OperationStatus::Compensated);
        assert_eq!(api.range_values("s1", "A1:B10"), json!([["h1", "h2"]]));
        assert_eq!(api.call_count(crate::testing::READ_STATE), 0);
    }

    /// Validates that an irreversible operation makes the transaction FAILED.
    ///
    /// Assertions:
    /// - Confirms compensation_failed for the irreversible operation.
    /// - Confirms status FAILED and code PARTIAL_FAILURE.
    #[tokio::test]
    async fn test_irreversible_operation_fails_transaction() {
        let api = Arc::new(ScriptedSpreadsheetApi::new());
        let (coordinator, _clock) = coordinator(api.clone());
        let tx = coordinator.begin("t1").expect("begin");
        let add = json!({ "spreadsheetId": "s1", "title": "Q4" });
        coordinator.queue(tx, Operation::new("sheets_core", "add_sheet", add)).expect("queue");
        coordinator.queue(tx, write("A1", json!([[1]]))).expect("queue");
        api.fail_always("sheets_data.write", UpstreamError::from_status(503, "down"));

        let err = coordinator.commit(tx).await.expect_err("aborted");
        assert_eq!(err.code(), ErrorCode::PartialFailure);
        let summary = coordinator.status(tx).expect("status");
        assert_eq!(summary.status, TransactionStatus::Failed);
        assert_eq!(summary.operations[0].status, OperationStatus::CompensationFailed);
    }

    /// Validates explicit compensation operations.
    ///
    /// Assertions:
    /// - Confirms the caller-supplied inverse runs instead of a restore.
    #[tokio::test]
    async fn test_explicit_compensation_runs() {
        let api = Arc::new(ScriptedSpreadsheetApi::new());
        let (coordinator, _clock) = coordinator(api.clone());
        let tx = coordinator.begin("t1").expect("begin");
        let args = json!({ "spreadsheetId": "s1", "title": "Q4" });
        let add = Operation::new("sheets_core", "add_sheet", args.clone())
            .with_compensation(Operation::new("sheets_core", "delete_sheet", args));
        coordinator.queue(tx, add).expect("queue");
        coordinator.queue(tx, write("A1", json!([[1]]))).expect("queue");
        api.fail_always("sheets_data.write", UpstreamError::from_status(400, "bad"));

        let err = coordinator.commit(tx).await.expect_err("aborted");
        assert_eq!(err.code(), ErrorCode::PartialFailure);
        assert_eq!(api.call_count("sheets_core.delete_sheet"), 1);
        assert_eq!(coordinator.status(tx).expect("status").status, TransactionStatus::RolledBack);
    }

    /// Validates inactivity expiry and retention pruning.
    ///
    /// Assertions:
    /// - Confirms an idle transaction becomes ROLLED_BACK and rejects queue.
    /// - Confirms purge removes it once retention has elapsed.
    #[tokio::test]
    async fn test_idle_expiry_and_purge() {
        let api = Arc::new(ScriptedSpreadsheetApi::new());
        let (coordinator, clock) = coordinator(api);
        let tx = coordinator.begin("t1").expect("begin");
        coordinator.queue(tx, write("A1", json!([[1]]))).expect("queue");

        clock.advance(Duration::from_secs(5 * 60));
        let err = coordinator.queue(tx, write("B1", json!([[1]]))).expect_err("expired");
        assert_eq!(err.code(), ErrorCode::InvalidState);
        let summary = coordinator.status(tx).expect("status");
        assert_eq!(summary.status, TransactionStatus::RolledBack);
        assert_eq!(summary.operations[0].status, OperationStatus::NotAttempted);

        assert_eq!(coordinator.purge_expired(), 0);
        clock.advance(Duration::from_secs(60 * 60));
        assert_eq!(coordinator.purge_expired(), 1);
        assert!(matches!(coordinator.status(tx), Err(GatewayError::TransactionNotFound { .. })));
    }

    /// Validates rollback semantics and listing.
    ///
    /// Assertions:
    /// - Confirms rollback is idempotent and nothing reaches upstream.
    /// - Confirms list filters by tenant.
    #[tokio::test]
    async fn test_rollback_and_list() {
        let api = Arc::new(ScriptedSpreadsheetApi::new());
        let (coordinator, _clock) = coordinator(api.clone());
        let a = coordinator.begin("t1").expect("begin");
        let b = coordinator.begin("t2").expect("begin");
        coordinator.queue(a, write("A1", json!([[1]]))).expect("queue");

        let summary = coordinator.rollback(a).expect("rollback");
        assert_eq!(summary.status, TransactionStatus::RolledBack);
        assert_eq!(coordinator.rollback(a).expect("again").status, TransactionStatus::RolledBack);
        assert!(coordinator.commit(a).await.is_err());
        assert_eq!(api.total_calls(), 0);

        assert_eq!(coordinator.list(None).len(), 2);
        let t2: Vec<TransactionId> = coordinator.list(Some("t2")).iter().map(|s| s.id).collect();
        assert_eq!(t2, vec![b]);
    }

    /// Validates expected-state conflicts inside a transaction.
    ///
    /// Assertions:
    /// - Confirms CONFLICT names the divergent operation.
    #[tokio::test]
    async fn test_conflict_reports_operation_index() {
        let api =
            Arc::new(ScriptedSpreadsheetApi::new().with_range("s1", "B1", json!([["theirs"]])));
        let (coordinator, _clock) = coordinator(api);
        let tx = coordinator.begin("t1").expect("begin");
        coordinator.queue(tx, write("A1", json!([[1]]))).expect("queue");
        coordinator
            .queue(
                tx,
                write("B1", json!([[2]]))
                    .with_expected_state(ExpectedState::values(json!([["mine"]]))),
            )
            .expect("queue");

        let err = coordinator.commit(tx).await.expect_err("conflict");
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert_eq!(err.to_payload().details.operation_index, Some(1));
    }
}
