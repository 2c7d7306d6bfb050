//! Configuration management

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::errors::GatewayError;
use crate::types::QuotaPolicy;

/// Gateway configuration; every field has a default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub circuit_breaker: CircuitBreakerSettings,
    pub connection_health: HealthSettings,
    pub quota: QuotaPolicy,
    pub cache: CacheSettings,
    pub transactions: TransactionSettings,
    pub retry: RetrySettings,
    pub state_store: StateStoreSettings,
    pub logging: LoggingSettings,
}

impl GatewayConfig {
    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<(), GatewayError> {
        let checks: [(&str, u64); 11] = [
            ("circuit_breaker.failure_threshold", self.circuit_breaker.failure_threshold),
            ("circuit_breaker.timeout_ms", self.circuit_breaker.timeout_ms),
            ("circuit_breaker.half_open_max_calls", self.circuit_breaker.half_open_max_calls),
            (
                "connection_health.reset_threshold",
                u64::from(self.connection_health.reset_threshold),
            ),
            ("connection_health.max_idle_ms", self.connection_health.max_idle_ms),
            ("connection_health.window_size", self.connection_health.window_size as u64),
            ("cache.ttl_ms", self.cache.ttl_ms),
            ("cache.max_entries", self.cache.max_entries as u64),
            ("transactions.inactivity_timeout_ms", self.transactions.inactivity_timeout_ms),
            ("transactions.max_operations", self.transactions.max_operations as u64),
            ("retry.max_attempts", u64::from(self.retry.max_attempts)),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, value)| *value == 0) {
            return Err(GatewayError::config(format!("{name} must be greater than zero")));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(GatewayError::config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        if self.state_store.backend == StateBackend::Sqlite
            && self.state_store.path.trim().is_empty()
        {
            return Err(GatewayError::config("state_store.path is required for the sqlite backend"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u64,
    pub timeout_ms: u64,
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CB_FAILURE_THRESHOLD,
            timeout_ms: DEFAULT_CB_TIMEOUT_MS,
            half_open_max_calls: DEFAULT_CB_HALF_OPEN_MAX_CALLS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub reset_threshold: u32,
    pub max_idle_ms: u64,
    /// Number of recent outcomes behind the health score
    pub window_size: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            reset_threshold: DEFAULT_HEALTH_RESET_THRESHOLD,
            max_idle_ms: DEFAULT_HEALTH_MAX_IDLE_MS,
            window_size: DEFAULT_HEALTH_WINDOW_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { ttl_ms: DEFAULT_CACHE_TTL_MS, max_entries: DEFAULT_CACHE_MAX_ENTRIES }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    pub inactivity_timeout_ms: u64,
    /// How long terminal transactions stay visible to `status`/`list`
    pub retention_ms: u64,
    pub reaper_interval_ms: u64,
    pub max_operations: usize,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: DEFAULT_TX_INACTIVITY_TIMEOUT_MS,
            retention_ms: DEFAULT_TX_RETENTION_MS,
            reaper_interval_ms: DEFAULT_TX_REAPER_INTERVAL_MS,
            max_operations: DEFAULT_TX_MAX_OPERATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

/// Where quota counters and circuit state live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Process-local; degraded
    #[default]
    Memory,
    Sqlite,
}

impl StateBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "local" => Some(Self::Memory),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

impl fmt::Display for StateBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateStoreSettings {
    pub backend: StateBackend,
    pub path: String,
    pub pool_size: u32,
}

impl Default for StateStoreSettings {
    fn default() -> Self {
        Self {
            backend: StateBackend::Memory,
            path: DEFAULT_SQLITE_PATH.to_string(),
            pool_size: DEFAULT_SQLITE_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "human" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}
