//! Keyed quota and circuit state

pub mod memory;
pub mod ports;

pub use memory::InMemoryStateStore;
pub use ports::{
    CircuitUpdate, QuotaConsumeOutcome, StateStore, StoreDescriptor, StoreError, StoreResult,
};
