//! Port interface for the remote spreadsheet API
//!
//! The gateway never speaks HTTP itself; infra supplies an implementation
//! and tests supply a scripted fake.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sheetgate_common::{CallOutcome, ErrorClassification, ErrorSeverity};
use sheetgate_domain::{GatewayError, Operation, StateTarget};
use thiserror::Error;

/// Remote spreadsheet API
#[async_trait]
pub trait SpreadsheetApi: Send + Sync {
    /// Perform one operation
    async fn call(&self, operation: &Operation) -> Result<Value, UpstreamError>;

    /// Read the current values of a range, for conflict checks and prior-value
    /// capture
    async fn read_state(&self, target: &StateTarget) -> Result<Value, UpstreamError>;

    /// Drop and re-establish the connections of a pool
    async fn reset_connection(&self, pool: &str) -> Result<(), UpstreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorKind {
    /// 429
    RateLimited,
    /// 500, 502, 503, 504
    Unavailable,
    StreamReset,
    Timeout,
    /// 401
    Unauthenticated,
    /// 403
    PermissionDenied,
    /// 404
    NotFound,
    /// 400, 409 and other 4xx
    InvalidRequest,
    Other,
}

impl UpstreamErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            500 | 502 | 503 | 504 => Self::Unavailable,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            400..=499 => Self::InvalidRequest,
            _ => Self::Other,
        }
    }

    /// Availability failures worth retrying
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable | Self::StreamReset | Self::Timeout)
    }

    pub fn is_auth(self) -> bool {
        matches!(self, Self::Unauthenticated | Self::PermissionDenied)
    }

    /// Whether the upstream answered at all; client errors prove the
    /// connection is alive
    pub fn connection_alive(self) -> bool {
        matches!(
            self,
            Self::Unauthenticated | Self::PermissionDenied | Self::NotFound | Self::InvalidRequest
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::StreamReset => "stream_reset",
            Self::Timeout => "timeout",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::InvalidRequest => "invalid_request",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error returned by the upstream collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upstream {kind}{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Server-provided wait hint (`Retry-After`)
    pub retry_after: Option<Duration>,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self { kind, status: None, message: message.into(), retry_after: None }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Timeout, message)
    }

    pub fn stream_reset(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::StreamReset, message)
    }
}

/// How an error counts towards circuit state
pub trait BreakerOutcome {
    fn call_outcome(&self) -> CallOutcome;
}

impl BreakerOutcome for UpstreamError {
    /// Auth and client errors are not availability signals
    fn call_outcome(&self) -> CallOutcome {
        if self.kind.connection_alive() {
            CallOutcome::Neutral
        } else {
            CallOutcome::Failure
        }
    }
}

impl ErrorClassification for UpstreamError {
    fn is_retryable(&self) -> bool {
        self.kind.is_transient()
    }

    fn severity(&self) -> ErrorSeverity {
        match self.kind {
            UpstreamErrorKind::RateLimited
            | UpstreamErrorKind::StreamReset
            | UpstreamErrorKind::Timeout => ErrorSeverity::Warning,
            UpstreamErrorKind::NotFound | UpstreamErrorKind::InvalidRequest => ErrorSeverity::Info,
            UpstreamErrorKind::Unavailable | UpstreamErrorKind::Other => ErrorSeverity::Error,
            UpstreamErrorKind::Unauthenticated | UpstreamErrorKind::PermissionDenied => {
                ErrorSeverity::Critical
            }
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err.kind {
            UpstreamErrorKind::Unauthenticated | UpstreamErrorKind::PermissionDenied => {
                Self::Authentication { message: err.message, status: err.status }
            }
            UpstreamErrorKind::NotFound => Self::NotFound { message: err.message },
            kind => Self::Upstream {
                message: err.message,
                status: err.status,
                retryable: kind.is_transient(),
                retry_after_ms: err.retry_after.map(|d| d.as_millis() as u64),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use sheetgate_domain::ErrorCode;

    use super::*;

    /// Validates HTTP status classification.
    ///
    /// Assertions:
    /// - Confirms throttling and 5xx are transient.
    /// - Confirms 401/403 are auth and 409 is an invalid request.
    #[test]
    fn test_status_mapping() {
        assert_eq!(UpstreamErrorKind::from_status(429), UpstreamErrorKind::RateLimited);
        assert_eq!(UpstreamErrorKind::from_status(502), UpstreamErrorKind::Unavailable);
        assert_eq!(UpstreamErrorKind::from_status(409), UpstreamErrorKind::InvalidRequest);
        assert_eq!(UpstreamErrorKind::from_status(301), UpstreamErrorKind::Other);
        assert!(UpstreamErrorKind::from_status(503).is_transient());
        assert!(UpstreamErrorKind::from_status(403).is_auth());
        assert!(!UpstreamErrorKind::from_status(401).is_transient());
    }

    /// Validates breaker outcomes per error kind.
    ///
    /// Assertions:
    /// - Confirms auth errors are neutral and outages are failures.
    #[test]
    fn test_breaker_outcome() {
        assert_eq!(UpstreamError::from_status(401, "expired").call_outcome(), CallOutcome::Neutral);
        assert_eq!(UpstreamError::from_status(404, "gone").call_outcome(), CallOutcome::Neutral);
        assert_eq!(UpstreamError::from_status(503, "down").call_outcome(), CallOutcome::Failure);
        assert_eq!(UpstreamError::timeout("slow").call_outcome(), CallOutcome::Failure);
    }

    /// Validates conversion into the caller contract.
    ///
    /// Assertions:
    /// - Confirms the retry hint survives and auth maps to its own code.
    #[test]
    fn test_gateway_error_conversion() {
        let throttled =
            UpstreamError::from_status(429, "slow down").with_retry_after(Duration::from_secs(2));
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(2)));
        let gateway: GatewayError = throttled.into();
        assert_eq!(gateway.code(), ErrorCode::UpstreamError);
        assert!(gateway.is_retryable());
        assert_eq!(gateway.to_payload().details.retry_after_ms, Some(2_000));

        let denied: GatewayError = UpstreamError::from_status(403, "no access").into();
        assert_eq!(denied.code(), ErrorCode::AuthenticationFailed);
        assert!(!denied.is_retryable());
    }

    /// Validates the display form.
    ///
    /// Assertions:
    /// - Confirms kind and status appear in the message.
    #[test]
    fn test_display() {
        assert_eq!(
            UpstreamError::from_status(503, "backend down").to_string(),
            "upstream unavailable (503): backend down"
        );
        assert_eq!(
            UpstreamError::stream_reset("h2 reset").to_string(),
            "upstream stream_reset: h2 reset"
        );
    }
}
