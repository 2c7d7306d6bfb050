//! Circuit breakers per upstream service

pub mod registry;

pub use registry::{CircuitPermit, CircuitRegistry, CircuitStatus};
