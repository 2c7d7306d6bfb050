//! In-flight request deduplication
//!
//! Concurrent calls that share a tenant and fingerprint attach to a single
//! execution. The execution runs as its own task, so it completes (and its
//! side effects are accounted for) even if the caller that started it goes
//! away; every attached caller receives a clone of the same result.
//!
//! A write can detach in-flight reads of what it touched: the detached
//! execution still runs to completion for the callers already attached,
//! but later callers start a new one.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sheetgate_domain::{Fingerprint, GatewayError};
use tracing::debug;

type SharedExecution = Shared<BoxFuture<'static, Result<Value, GatewayError>>>;

/// Identity of an in-flight execution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub tenant_id: String,
    pub fingerprint: Fingerprint,
    /// Read-only executions can be detached by writes
    pub read_only: bool,
    pub spreadsheet_id: Option<String>,
}

impl DedupKey {
    pub fn new(tenant_id: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self { tenant_id: tenant_id.into(), fingerprint, read_only: false, spreadsheet_id: None }
    }

    /// Mark the execution as a read of `spreadsheet_id` (`None` for reads
    /// that name no spreadsheet)
    #[must_use]
    pub fn reading(mut self, spreadsheet_id: Option<&str>) -> Self {
        self.read_only = true;
        self.spreadsheet_id = spreadsheet_id.map(str::to_string);
        self
    }

    /// Whether a write to `spreadsheet_id` may change what this read sees
    fn overlaps_write(&self, tenant_id: &str, spreadsheet_id: Option<&str>) -> bool {
        self.read_only
            && self.tenant_id == tenant_id
            && match (spreadsheet_id, self.spreadsheet_id.as_deref()) {
                (Some(written), Some(read)) => written == read,
                _ => true,
            }
    }
}

struct InFlight {
    id: u64,
    execution: SharedExecution,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    /// Executions actually started
    pub executions: u64,
    /// Callers that attached to an execution already in flight
    pub joined: u64,
    pub in_flight: usize,
}

#[derive(Default)]
pub struct RequestDeduplicator {
    in_flight: Arc<DashMap<DedupKey, InFlight>>,
    executions: AtomicU64,
    joined: AtomicU64,
}

impl RequestDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` unless an execution for `key` is already in flight, in
    /// which case wait for that one instead
    ///
    /// `work` is only polled when this call becomes the leader.
    pub async fn run<F>(&self, key: DedupKey, work: F) -> Result<Value, GatewayError>
    where
        F: Future<Output = Result<Value, GatewayError>> + Send + 'static,
    {
        let execution = match self.in_flight.entry(key) {
            Entry::Occupied(entry) => {
                self.joined.fetch_add(1, Ordering::Relaxed);
                debug!(
                    tenant_id = %entry.key().tenant_id,
                    fingerprint = %entry.key().fingerprint,
                    "joined in-flight execution"
                );
                entry.get().execution.clone()
            }
            Entry::Vacant(entry) => {
                let id = self.executions.fetch_add(1, Ordering::Relaxed);
                let in_flight = Arc::clone(&self.in_flight);
                let execution = Self::spawn(in_flight, entry.key().clone(), id, work);
                entry.insert(InFlight { id, execution: execution.clone() });
                execution
            }
        };
        execution.await
    }

    /// Stop new callers from joining reads a write to `spreadsheet_id` may
    /// have made stale; `None` detaches every read of the tenant
    pub fn detach_reads(&self, tenant_id: &str, spreadsheet_id: Option<&str>) -> usize {
        let mut detached = 0;
        self.in_flight.retain(|key, _| {
            let overlaps = key.overlaps_write(tenant_id, spreadsheet_id);
            detached += usize::from(overlaps);
            !overlaps
        });
        if detached > 0 {
            debug!(tenant_id, spreadsheet_id, detached, "detached in-flight reads after a write");
        }
        detached
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            executions: self.executions.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }

    // The spawned task removes its own entry, matched by id so that it never
    // removes a newer execution started after this one was detached. The
    // removal cannot overtake the insert in `run`: it needs the shard lock
    // the vacant entry still holds.
    fn spawn<F>(
        in_flight: Arc<DashMap<DedupKey, InFlight>>,
        key: DedupKey,
        id: u64,
        work: F,
    ) -> SharedExecution
    where
        F: Future<Output = Result<Value, GatewayError>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let result = work.await;
            in_flight.remove_if(&key, |_, entry| entry.id == id);
            result
        });
        async move {
            handle
                .await
                .unwrap_or_else(|err| {
                    Err(GatewayError::internal(format!("deduplicated execution aborted: {err}")))
                })
        }
        .boxed()
        .shared()
    }
}
