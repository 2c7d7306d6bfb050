//! Connection health monitoring

pub mod monitor;

pub use monitor::ConnectionHealthMonitor;
