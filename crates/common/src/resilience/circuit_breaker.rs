//! Circuit breaker state machine and time abstraction
//!
//! The breaker is split in two halves. [`CircuitSnapshot`] is plain,
//! serializable data with pure transition functions; whoever owns the state
//! (a process-local map, a shared SQLite row) applies those functions inside
//! its own critical section. That keeps the transition rules in exactly one
//! place while letting the storage decide how atomicity is achieved.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

//==============================================================================
// Time Abstraction for Testability
//==============================================================================

/// Trait for time operations to enable deterministic testing
///
/// Production code uses [`SystemClock`]; tests drive [`MockClock`] forward
/// explicitly so that breaker timeouts, quota windows and cache TTLs can be
/// exercised without sleeping.
pub trait Clock: Send + Sync + 'static {
    /// Get current instant (monotonic time)
    fn now(&self) -> Instant;

    /// Get current system time (wall clock)
    fn system_time(&self) -> SystemTime;

    /// Get milliseconds since UNIX epoch
    fn millis_since_epoch(&self) -> u64 {
        self.system_time().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }

    /// Wall clock as a UTC timestamp
    fn utc_now(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.millis_since_epoch()).unwrap_or(i64::MAX);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
    }
}

/// Real system clock implementation for production use
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Implement Clock for Arc<T> where T: Clock for convenient cloning
impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn system_time(&self) -> SystemTime {
        (**self).system_time()
    }
}

/// Mock clock for deterministic testing
///
/// Wall-clock time is `UNIX_EPOCH + base + elapsed`, where `base` is zero
/// unless the clock was created with [`MockClock::at_millis`]. Clones share
/// the same elapsed counter.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    base: Duration,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current instant
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            base: Duration::ZERO,
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Create a mock clock whose wall time starts at `epoch_millis`
    pub fn at_millis(epoch_millis: u64) -> Self {
        Self {
            start: Instant::now(),
            base: Duration::from_millis(epoch_millis),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Create a mock clock whose wall time starts at the given UTC timestamp
    pub fn at(datetime: DateTime<Utc>) -> Self {
        Self::at_millis(u64::try_from(datetime.timestamp_millis()).unwrap_or_default())
    }

    /// Advance the mock clock by a duration
    pub fn advance(&self, duration: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += duration;
        }
    }

    /// Advance the mock clock by milliseconds (convenience method)
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Set the mock clock to a specific elapsed time
    pub fn set_elapsed(&self, duration: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed = duration;
        }
    }

    /// Get the current elapsed time
    pub fn elapsed(&self) -> Duration {
        self.elapsed.lock().map(|e| *e).unwrap_or(Duration::ZERO)
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.base + self.elapsed()
    }
}

//==============================================================================
// Configuration
//==============================================================================

/// Simple configuration error for validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Configuration result type using simple config errors
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    #[default]
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing a single trial request
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by gauges (0 closed, 1 half-open, 2 open)
    pub fn as_gauge(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }

    /// Parse the wire representation produced by `Display`
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CLOSED" => Some(Self::Closed),
            "OPEN" => Some(Self::Open),
            "HALF_OPEN" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u64,
    /// Time to wait before transitioning from open to half-open
    pub timeout: Duration,
    /// Maximum number of concurrent trial calls in half-open state
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, timeout: Duration::from_secs(30), half_open_max_calls: 1 }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "failure_threshold must be greater than 0".to_string(),
            });
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                message: "timeout must be greater than 0".to_string(),
            });
        }

        if self.half_open_max_calls == 0 {
            return Err(ConfigError::Invalid {
                message: "half_open_max_calls must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// State Machine
//==============================================================================

/// Result of asking a circuit for permission to dispatch a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAdmission {
    /// The call may proceed. `trial` is set when it is the half-open trial call.
    Granted { trial: bool },
    /// The call must fail fast without reaching the upstream
    Rejected { state: CircuitState, retry_after: Duration },
}

impl CallAdmission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// How a finished call counts towards circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure,
    /// Says nothing about availability (e.g. rejected credentials)
    Neutral,
}

/// Serializable per-circuit state plus its transition rules
///
/// Only the transitions CLOSED→OPEN, OPEN→HALF_OPEN, HALF_OPEN→CLOSED and
/// HALF_OPEN→OPEN are ever produced. Outcomes of calls that were not the
/// half-open trial never move a circuit out of OPEN or HALF_OPEN.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub opened_at_ms: Option<u64>,
    pub next_attempt_at_ms: Option<u64>,
    pub half_open_in_flight: u64,
    /// When the current half-open trial was handed out
    pub trial_started_at_ms: Option<u64>,
}

impl CircuitSnapshot {
    /// Decide whether a call may be dispatched at `now_ms`, transitioning
    /// OPEN→HALF_OPEN when the open timeout has elapsed.
    ///
    /// Calling this repeatedly while OPEN is idempotent: no state changes and
    /// no trial is granted until `next_attempt_at_ms`.
    pub fn try_acquire(&mut self, now_ms: u64, config: &CircuitBreakerConfig) -> CallAdmission {
        match self.state {
            CircuitState::Closed => CallAdmission::Granted { trial: false },
            CircuitState::Open => {
                let next_attempt = self.next_attempt_at_ms.unwrap_or(now_ms);
                if now_ms < next_attempt {
                    return CallAdmission::Rejected {
                        state: CircuitState::Open,
                        retry_after: Duration::from_millis(next_attempt - now_ms),
                    };
                }
                self.state = CircuitState::HalfOpen;
                self.half_open_in_flight = 1;
                self.trial_started_at_ms = Some(now_ms);
                CallAdmission::Granted { trial: true }
            }
            CircuitState::HalfOpen => {
                // A trial whose outcome never came back (caller dropped) must
                // not wedge the circuit forever.
                let stale = self
                    .trial_started_at_ms
                    .is_some_and(|started| now_ms.saturating_sub(started) >= config.timeout_ms());
                if stale {
                    self.half_open_in_flight = 0;
                }

                if self.half_open_in_flight < config.half_open_max_calls {
                    self.half_open_in_flight += 1;
                    self.trial_started_at_ms = Some(now_ms);
                    CallAdmission::Granted { trial: true }
                } else {
                    CallAdmission::Rejected {
                        state: CircuitState::HalfOpen,
                        retry_after: config.timeout.min(Duration::from_secs(1)),
                    }
                }
            }
        }
    }

    /// Record a successful call
    pub fn on_success(&mut self, trial: bool) {
        match self.state {
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => self.close(),
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn on_failure(&mut self, now_ms: u64, trial: bool, config: &CircuitBreakerConfig) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed if self.consecutive_failures >= config.failure_threshold => {
                self.open(now_ms, config);
            }
            CircuitState::HalfOpen if trial => self.open(now_ms, config),
            CircuitState::Closed | CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// Record an outcome that says nothing about availability (for example an
    /// authentication failure). Only releases a held trial slot.
    pub fn on_neutral(&mut self, trial: bool) {
        if trial && self.state == CircuitState::HalfOpen {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Apply a call outcome; dispatches to the matching transition
    pub fn record(
        &mut self,
        outcome: CallOutcome,
        trial: bool,
        now_ms: u64,
        config: &CircuitBreakerConfig,
    ) {
        match outcome {
            CallOutcome::Success => self.on_success(trial),
            CallOutcome::Failure => self.on_failure(now_ms, trial, config),
            CallOutcome::Neutral => self.on_neutral(trial),
        }
    }

    /// Milliseconds until the circuit will accept a trial, if currently open
    pub fn retry_after_ms(&self, now_ms: u64) -> Option<u64> {
        match self.state {
            CircuitState::Open => self.next_attempt_at_ms.map(|next| next.saturating_sub(now_ms)),
            _ => None,
        }
    }

    fn open(&mut self, now_ms: u64, config: &CircuitBreakerConfig) {
        self.state = CircuitState::Open;
        self.opened_at_ms = Some(now_ms);
        self.next_attempt_at_ms = Some(now_ms.saturating_add(config.timeout_ms()));
        self.half_open_in_flight = 0;
        self.trial_started_at_ms = None;
    }

    fn close(&mut self) {
        *self = Self::default();
    }
}
