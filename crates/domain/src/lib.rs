//! # SheetGate Domain
//!
//! Domain types for the SheetGate resilience layer.
//!
//! This crate contains:
//! - Operations, fingerprints and the static action → class table
//! - Quota windows, limits and usage reports
//! - Transaction and per-operation report types
//! - The caller-facing error contract
//! - Configuration structures and defaults
//!
//! ## Architecture
//! - No dependencies on other SheetGate crates
//! - Only external dependencies allowed
//! - Pure data and pure functions; no I/O, no clocks

pub mod config;
pub mod constants;
pub mod errors;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use types::*;
