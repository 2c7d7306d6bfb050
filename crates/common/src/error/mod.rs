//! Error classification shared by every SheetGate layer
//!
//! Each layer owns its own `thiserror` enum; what they share is the
//! [`ErrorClassification`] interface, so that retry loops, circuit breakers
//! and log-level decisions can be written once against the trait instead of
//! against concrete error types.
//!
//! ```rust,ignore
//! #[derive(Debug, Error)]
//! pub enum FetchError {
//!     #[error("upstream throttled")]
//!     Throttled { retry_after: Option<Duration> },
//!     #[error("bad request: {0}")]
//!     BadRequest(String),
//! }
//!
//! impl ErrorClassification for FetchError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, Self::Throttled { .. })
//!     }
//!     // ... implement other trait methods
//! }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Trait for classifying errors by their operational characteristics
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient issues that may succeed if attempted
    /// again, such as throttling, connection resets or timeouts.
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    ///
    /// Used for monitoring, alerting, and logging decisions.
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    /// Get the suggested retry delay if applicable
    ///
    /// Returns `Some(Duration)` when a specific delay is recommended (e.g.
    /// from a `Retry-After` header), or `None` if no specific delay is
    /// suggested.
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Throttled(Option<Duration>);

    impl ErrorClassification for Throttled {
        fn is_retryable(&self) -> bool {
            true
        }

        fn severity(&self) -> ErrorSeverity {
            ErrorSeverity::Warning
        }

        fn retry_after(&self) -> Option<Duration> {
            self.0
        }
    }

    #[derive(Debug)]
    struct Corrupted;

    impl ErrorClassification for Corrupted {
        fn is_retryable(&self) -> bool {
            false
        }

        fn severity(&self) -> ErrorSeverity {
            ErrorSeverity::Critical
        }

        fn retry_after(&self) -> Option<Duration> {
            None
        }
    }

    /// Validates the default `is_critical` derivation from severity.
    ///
    /// Assertions:
    /// - Ensures warning-level errors are not critical.
    /// - Ensures critical-level errors are critical.
    #[test]
    fn test_is_critical_follows_severity() {
        assert!(!Throttled(None).is_critical());
        assert!(Corrupted.is_critical());
        let throttled = Throttled(Some(Duration::from_secs(2)));
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(2)));
    }

    /// Validates severity ordering and display labels.
    ///
    /// Assertions:
    /// - Ensures `Info < Warning < Error < Critical`.
    /// - Confirms display strings match log level labels.
    #[test]
    fn test_severity_ordering_and_display() {
        assert!(ErrorSeverity::Info < ErrorSeverity::Warning);
        assert!(ErrorSeverity::Warning < ErrorSeverity::Error);
        assert!(ErrorSeverity::Error < ErrorSeverity::Critical);
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARN");
        assert_eq!(ErrorSeverity::Critical.to_string(), "CRITICAL");
    }
}
