//! Port interface for shared quota and circuit state
//!
//! Quota counters and circuit snapshots are keyed state behind this trait
//! and injected into the services. Every mutating method is one atomic
//! operation from the caller's point of view: implementations must apply
//! the check and the update inside a single critical section (an entry
//! lock, a database transaction).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sheetgate_common::{
    CallAdmission, CallOutcome, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
    ErrorClassification, ErrorSeverity,
};
use sheetgate_domain::{GatewayError, QuotaCounterKey, QuotaDemand};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend could not be reached or is busy
    #[error("state store unavailable: {message}")]
    Unavailable { message: String },

    /// The backend answered with an error
    #[error("state store backend error: {message}")]
    Backend { message: String },

    /// Stored data could not be decoded
    #[error("corrupt state: {message}")]
    Corrupt { message: String },

    #[error("invalid state store request: {message}")]
    InvalidRequest { message: String },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into() }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }
}

impl ErrorClassification for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Unavailable { .. } => ErrorSeverity::Warning,
            Self::Backend { .. } | Self::InvalidRequest { .. } => ErrorSeverity::Error,
            Self::Corrupt { .. } => ErrorSeverity::Critical,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        Self::StateStore { message: err.to_string() }
    }
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Identity of a state store backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDescriptor {
    pub backend: String,
    /// Whether state is visible to other processes and survives restarts
    pub shared: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl StoreDescriptor {
    /// Process-local state is degraded mode
    pub fn degraded(&self) -> bool {
        !self.shared
    }
}

/// Result of an atomic multi-counter check-and-increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaConsumeOutcome {
    /// Every counter was incremented; counts after the increment, in demand
    /// order
    Admitted { counts: Vec<u64> },
    /// Nothing was incremented; `index` names the first demand that would
    /// have exceeded its limit
    Rejected { index: usize, count: u64 },
}

/// A circuit transition applied by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitUpdate {
    pub previous: CircuitState,
    pub current: CircuitSnapshot,
}

impl CircuitUpdate {
    pub fn changed(&self) -> bool {
        self.previous != self.current.state
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    fn descriptor(&self) -> StoreDescriptor;

    /// Add `cost` to every demanded counter, or to none if any would exceed
    /// its limit. All demands belong to one tenant and operation class.
    ///
    /// Windows only move forward: a demand whose bucket is older than the
    /// stored one (a caller that read the clock just before a boundary) is
    /// checked and charged against the stored, newer window.
    async fn quota_try_consume(
        &self,
        demands: &[QuotaDemand],
        cost: u64,
    ) -> StoreResult<QuotaConsumeOutcome>;

    /// Subtract `cost` from each counter still in the window named by its
    /// key, never below zero; counters in any other window are untouched
    async fn quota_release(&self, keys: &[QuotaCounterKey], cost: u64) -> StoreResult<()>;

    /// Current counts; a counter left over from an earlier window reads as
    /// zero
    async fn quota_counts(&self, keys: &[QuotaCounterKey]) -> StoreResult<Vec<u64>>;

    /// Ask circuit `name` for permission to dispatch at `now_ms`, applying
    /// any OPEN→HALF_OPEN transition
    async fn circuit_acquire(
        &self,
        name: &str,
        now_ms: u64,
        config: &CircuitBreakerConfig,
    ) -> StoreResult<CallAdmission>;

    /// Apply the outcome of a dispatched call
    async fn circuit_record(
        &self,
        name: &str,
        outcome: CallOutcome,
        trial: bool,
        now_ms: u64,
        config: &CircuitBreakerConfig,
    ) -> StoreResult<CircuitUpdate>;

    /// Snapshot of one circuit; unknown circuits are CLOSED
    async fn circuit_snapshot(&self, name: &str) -> StoreResult<CircuitSnapshot>;

    /// Every circuit the store has seen, sorted by name
    async fn circuit_snapshots(&self) -> StoreResult<Vec<(String, CircuitSnapshot)>>;

    /// Force a circuit back to CLOSED
    async fn circuit_reset(&self, name: &str) -> StoreResult<()>;
}
