//! Resilience patterns for fault tolerance
//!
//! This module provides **generic, reusable** resilience building blocks:
//! - **Clock**: monotonic + wall time behind a trait, with a mock for tests
//! - **Circuit state machine**: [`CircuitSnapshot`] holds the per-circuit
//!   state and the transition rules; storage and atomicity are left to the
//!   caller so the same rules work in-process and against a shared store
//! - **Retry Logic**: configurable retry strategies with exponential backoff
//!   and jitter
//!
//! Nothing here knows about tenants or spreadsheets; the gateway's circuit
//! registry and execution pipeline are built on top of these types.

pub mod circuit_breaker;
pub mod retry;

// Re-export circuit breaker types
pub use circuit_breaker::{
    CallAdmission, CallOutcome, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitSnapshot,
    CircuitState, Clock, ConfigError, ConfigResult, MockClock, SystemClock,
};
// Re-export retry types
pub use retry::{
    policies, BackoffStrategy, Jitter, RetryConfig, RetryConfigBuilder, RetryDecision,
    RetryError, RetryExecutor, RetryPolicy, RetryResult,
};
