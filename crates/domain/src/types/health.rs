//! Connection health records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a pool needs before its next upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSignal {
    Healthy,
    /// Too many consecutive errors; recycle the pool
    ResetRequired,
    /// Idle past the limit; refresh the pool proactively
    RefreshRequired,
}

impl HealthSignal {
    pub fn needs_recycle(self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealthRecord {
    pub pool_name: String,
    pub consecutive_errors: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Weighted recent success ratio, 0 to 100
    pub health_score: u8,
    pub signal: HealthSignal,
    pub total_successes: u64,
    pub total_errors: u64,
    pub resets: u64,
}

impl ConnectionHealthRecord {
    /// Record for a pool that has not been used yet
    pub fn fresh(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            consecutive_errors: 0,
            last_success_at: None,
            health_score: 100,
            signal: HealthSignal::Healthy,
            total_successes: 0,
            total_errors: 0,
            resets: 0,
        }
    }
}
