//! The path every upstream call takes

pub mod executor;

pub use executor::{retry_config, ExecutionPipeline};
