//! # SheetGate Infrastructure
//!
//! Infrastructure implementations of core ports.
//!
//! This crate contains:
//! - The SQLite state store shared by gateway processes on one host
//! - The Google Sheets HTTP client (reqwest)
//! - Configuration loading, logging setup and Prometheus export
//! - [`GatewayContext`], which wires them into a running gateway
//!
//! ## Architecture
//! - Implements traits defined in `sheetgate-core`
//! - Depends on `sheetgate-common`, `sheetgate-domain` and `sheetgate-core`
//! - Contains all "impure" code (I/O, network, file system)

pub mod config;
pub mod context;
pub mod database;
mod errors;
pub mod http;
pub mod logging;
pub mod observability;

// Re-export commonly used items
pub use context::{build_state_store, GatewayContext};
pub use database::{DbManager, SqliteStateStore};
pub use http::{AccessTokenProvider, SheetsHttpClient, SheetsHttpClientBuilder, StaticTokenProvider};
pub use observability::MetricsExporter;
