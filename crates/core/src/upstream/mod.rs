//! Upstream spreadsheet API boundary

pub mod ports;

pub use ports::{BreakerOutcome, SpreadsheetApi, UpstreamError, UpstreamErrorKind};
