//! Caller-facing error contract

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{OperationReport, OperationStatus, TransactionStatus};

/// Stable machine-readable error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Quota exhausted or circuit open; honour the wait hint
    RateLimited,
    Conflict,
    UpstreamError,
    /// Transaction aborted after partial application
    PartialFailure,
    AuthenticationFailed,
    NotFound,
    InvalidState,
    InvalidInput,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::Conflict => "CONFLICT",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every gateway operation
///
/// Circuit-open and quota rejections share [`ErrorCode::RateLimited`]; they
/// are told apart by `details.circuitBreakerState` vs `details.quotaType`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayError {
    #[error(
        "quota exceeded for tenant {tenant_id} ({quota_type}, limit {limit}); \
         resets at {reset_time}"
    )]
    QuotaExceeded {
        tenant_id: String,
        /// `<class>:<window>`
        quota_type: String,
        limit: u64,
        reset_time: DateTime<Utc>,
        retry_after_ms: u64,
    },

    #[error("circuit '{circuit}' is {state}; retry in {retry_after_ms} ms")]
    CircuitOpen { circuit: String, state: String, retry_after_ms: u64 },

    #[error("expected state mismatch for {spreadsheet_id}!{range}")]
    Conflict { spreadsheet_id: String, range: String, operation_index: Option<usize> },

    #[error("upstream error: {message}")]
    Upstream { message: String, status: Option<u16>, retryable: bool, retry_after_ms: Option<u64> },

    #[error("authentication failed: {message}")]
    Authentication { message: String, status: Option<u16> },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("transaction {transaction_id} not found")]
    TransactionNotFound { transaction_id: String },

    #[error("transaction {transaction_id} aborted ({status}): {cause}")]
    TransactionAborted {
        transaction_id: String,
        status: TransactionStatus,
        /// Index of the operation whose failure triggered the abort
        failed_index: Option<usize>,
        cause: Box<GatewayError>,
        operations: Vec<OperationReport>,
    },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("state store error: {message}")]
    StateStore { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::QuotaExceeded { .. } | Self::CircuitOpen { .. } => ErrorCode::RateLimited,
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::Upstream { .. } => ErrorCode::UpstreamError,
            Self::Authentication { .. } => ErrorCode::AuthenticationFailed,
            Self::NotFound { .. } | Self::TransactionNotFound { .. } => ErrorCode::NotFound,
            Self::TransactionAborted { status, cause, operations, .. } => {
                if *status == TransactionStatus::Failed {
                    ErrorCode::PartialFailure
                } else if matches!(**cause, Self::Conflict { .. }) {
                    ErrorCode::Conflict
                } else if operations.iter().any(|op| op.status == OperationStatus::Compensated) {
                    ErrorCode::PartialFailure
                } else {
                    cause.code()
                }
            }
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::InvalidInput { .. } => ErrorCode::InvalidInput,
            Self::StateStore { .. } | Self::Config { .. } | Self::Internal { .. } => {
                ErrorCode::Internal
            }
        }
    }

    /// Whether the same request may succeed later without changes
    ///
    /// Conflicts are not retryable as-is: the caller has to re-read first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QuotaExceeded { .. } | Self::CircuitOpen { .. } | Self::StateStore { .. } => true,
            Self::Upstream { retryable, .. } => *retryable,
            Self::TransactionAborted { status, cause, .. } => {
                *status == TransactionStatus::RolledBack && cause.is_retryable()
            }
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms().map(Duration::from_millis)
    }

    fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::QuotaExceeded { retry_after_ms, .. }
            | Self::CircuitOpen { retry_after_ms, .. } => Some(*retry_after_ms),
            Self::Upstream { retry_after_ms, .. } => *retry_after_ms,
            Self::TransactionAborted { cause, .. } if self.is_retryable() => cause.retry_after_ms(),
            _ => None,
        }
    }

    /// Wire representation returned to callers
    pub fn to_payload(&self) -> ErrorPayload {
        let mut details =
            ErrorDetails { retry_after_ms: self.retry_after_ms(), ..ErrorDetails::default() };
        match self {
            Self::QuotaExceeded { quota_type, reset_time, .. } => {
                details.quota_type = Some(quota_type.clone());
                details.reset_time = Some(*reset_time);
            }
            Self::CircuitOpen { state, .. } => {
                details.circuit_breaker_state = Some(state.clone());
            }
            Self::Conflict { operation_index, .. } => {
                details.operation_index = *operation_index;
            }
            Self::Upstream { status, .. } | Self::Authentication { status, .. } => {
                details.upstream_status = *status;
            }
            Self::TransactionNotFound { transaction_id } => {
                details.transaction_id = Some(transaction_id.clone());
            }
            Self::TransactionAborted { transaction_id, failed_index, cause, operations, .. } => {
                let inner = cause.to_payload().details;
                details.circuit_breaker_state = inner.circuit_breaker_state;
                details.quota_type = inner.quota_type;
                details.reset_time = inner.reset_time;
                details.upstream_status = inner.upstream_status;
                details.transaction_id = Some(transaction_id.clone());
                details.operation_index = *failed_index;
                details.operations = Some(operations.clone());
            }
            _ => {}
        }
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            details,
        }
    }
}

/// `{code, message, retryable, details}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub details: ErrorDetails,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<OperationReport>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
