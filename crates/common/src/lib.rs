//! Modular common utilities shared across SheetGate crates.
//!
//! Nothing in this crate knows about spreadsheets, tenants or MCP. It holds
//! the generic building blocks the gateway layers are assembled from.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error classification
//! - `runtime`: clock abstraction, circuit state machine, retry executor,
//!   TTL/LRU cache
//! - `observability`: tracing (pulled in by `runtime`)

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod cache;
#[cfg(feature = "runtime")]
pub mod resilience;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "runtime")]
pub use cache::{Cache, CacheConfig, CacheStats, EvictionReason};
#[cfg(feature = "foundation")]
pub use error::{ErrorClassification, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use resilience::{
    BackoffStrategy, CallAdmission, CallOutcome, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitSnapshot, CircuitState, Clock, ConfigError, Jitter, MockClock, RetryConfig,
    RetryConfigBuilder, RetryDecision, RetryError, RetryExecutor, RetryPolicy, RetryResult,
    SystemClock,
};
