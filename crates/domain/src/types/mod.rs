//! Domain types and models

pub mod action;
pub mod health;
pub mod operation;
pub mod quota;
pub mod transaction;

pub use action::{classify, ActionProfile, OperationClass, UpstreamService, ACTION_TABLE};
pub use health::{ConnectionHealthRecord, HealthSignal};
pub use operation::{
    content_checksum, normalize, ExpectedState, Fingerprint, Operation, OperationRequest,
    StateTarget,
};
pub use quota::{
    percent_used, QuotaCounterKey, QuotaDemand, QuotaLedgerEntry, QuotaLimits, QuotaPolicy,
    QuotaWindow, UsageStats, WindowLimits,
};
pub use transaction::{
    CommitReport, OperationReport, OperationStatus, TransactionId, TransactionStatus,
    TransactionSummary,
};
