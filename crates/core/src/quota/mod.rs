//! Tenant quota accounting

pub mod ledger;

pub use ledger::{QuotaCharge, QuotaLedger};
