//! Gateway constants
//!
//! Centralized defaults for every tunable owned by the resilience layer.

// Circuit breaker
pub const DEFAULT_CB_FAILURE_THRESHOLD: u64 = 5;
pub const DEFAULT_CB_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CB_HALF_OPEN_MAX_CALLS: u64 = 1;

// Connection health
pub const DEFAULT_HEALTH_RESET_THRESHOLD: u32 = 3;
pub const DEFAULT_HEALTH_MAX_IDLE_MS: u64 = 300_000;
pub const DEFAULT_HEALTH_WINDOW_SIZE: usize = 20;

// Result cache
pub const DEFAULT_CACHE_TTL_MS: u64 = 60_000;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1_000;

// Transactions
pub const DEFAULT_TX_INACTIVITY_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_TX_RETENTION_MS: u64 = 3_600_000;
pub const DEFAULT_TX_REAPER_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_TX_MAX_OPERATIONS: usize = 100;

// Upstream retry
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 200;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;

// State store
pub const DEFAULT_SQLITE_PATH: &str = "sheetgate-state.db";
pub const DEFAULT_SQLITE_POOL_SIZE: u32 = 4;

// Compensation
pub const COMPENSATION_TOOL: &str = "sheets_data";
pub const COMPENSATION_WRITE_ACTION: &str = "write";
pub const COMPENSATION_CLEAR_ACTION: &str = "clear";

/// Parameter keys that never contribute to an operation fingerprint
pub const VOLATILE_PARAMETER_KEYS: &[&str] = &[
    "timestamp",
    "requestTimestamp",
    "nonce",
    "clientNonce",
    "requestId",
    "traceId",
    "idempotencyKey",
    "_meta",
];

// Default quota limits per class (hourly, daily, monthly)
pub const DEFAULT_READ_LIMITS: (u64, u64, u64) = (3_000, 50_000, 1_000_000);
pub const DEFAULT_WRITE_LIMITS: (u64, u64, u64) = (1_000, 20_000, 300_000);
pub const DEFAULT_ADMIN_LIMITS: (u64, u64, u64) = (100, 1_000, 10_000);
