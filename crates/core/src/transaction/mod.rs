//! Multi-operation transactions with compensation

pub mod coordinator;

pub use coordinator::TransactionCoordinator;
