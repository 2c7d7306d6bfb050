//! # SheetGate Core
//!
//! Resilience and consistency services for the SheetGate MCP gateway.
//!
//! This crate contains:
//! - Port interfaces for the upstream spreadsheet API and the state store
//! - Connection health monitor, circuit registry and quota ledger
//! - Request deduplicator and result cache
//! - The execution pipeline every upstream call goes through
//! - The transaction coordinator and the [`Gateway`] facade
//!
//! ## Architecture Principles
//! - Depends only on `sheetgate-common` and `sheetgate-domain`
//! - No database, HTTP, or file-system code; adapters live in infra
//! - All external dependencies via traits
//! - Time comes from an injected [`Clock`](sheetgate_common::Clock)

pub mod circuit;
pub mod dedup;
pub mod gateway;
pub mod health;
pub mod pipeline;
pub mod quota;
pub mod state;
pub mod transaction;
pub mod upstream;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::sync::Arc;

use sheetgate_common::Clock;

/// Clock handle shared by every service
pub type SharedClock = Arc<dyn Clock>;

pub use circuit::{CircuitPermit, CircuitRegistry, CircuitStatus};
pub use dedup::{CacheKey, DedupKey, DedupStats, RequestDeduplicator, ResultCache};
pub use gateway::{Gateway, GatewayBuilder, GatewaySnapshot, StoreStatus};
pub use health::ConnectionHealthMonitor;
pub use pipeline::ExecutionPipeline;
pub use quota::{QuotaCharge, QuotaLedger};
pub use state::{
    CircuitUpdate, InMemoryStateStore, QuotaConsumeOutcome, StateStore, StoreDescriptor,
    StoreError, StoreResult,
};
pub use transaction::TransactionCoordinator;
pub use upstream::{BreakerOutcome, SpreadsheetApi, UpstreamError, UpstreamErrorKind};
