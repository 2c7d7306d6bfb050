//! Observability: Prometheus export of the gateway snapshot
//!
//! Logging lives in [`crate::logging`]; this module only turns
//! [`GatewaySnapshot`](sheetgate_core::GatewaySnapshot) values into metrics.

pub mod metrics;

pub use metrics::MetricsExporter;

/// Metrics error type
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Registration or encoding rejected by the prometheus crate
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Encoded output was not valid UTF-8
    #[error("metrics encoding failed: {0}")]
    Encoding(String),
}

/// Result type for metrics operations
pub type MetricsResult<T> = Result<T, MetricsError>;
