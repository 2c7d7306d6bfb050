//! Named circuit breakers backed by the state store
//!
//! The registry owns no state of its own. Admission and outcome recording
//! are single store operations, so the transition and the dispatch decision
//! for one circuit are atomic even when several processes share the store.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sheetgate_common::{
    CallAdmission, CallOutcome, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
};
use sheetgate_domain::GatewayError;
use tracing::{debug, info, warn};

use crate::state::StateStore;
use crate::upstream::BreakerOutcome;
use crate::SharedClock;

/// Permission to dispatch one call through a circuit
///
/// Must be handed back to [`CircuitRegistry::record`] with the outcome; a
/// dropped half-open permit is reclaimed after the open timeout.
#[derive(Debug)]
#[must_use = "a permit must be recorded with the call outcome"]
pub struct CircuitPermit {
    circuit: String,
    trial: bool,
}

impl CircuitPermit {
    pub fn circuit(&self) -> &str {
        &self.circuit
    }

    /// Whether this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Caller-facing view of one circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl CircuitStatus {
    fn from_snapshot(name: &str, snapshot: &CircuitSnapshot) -> Self {
        Self {
            name: name.to_string(),
            state: snapshot.state,
            consecutive_failures: snapshot.consecutive_failures,
            opened_at: snapshot.opened_at_ms.and_then(to_utc),
            next_attempt_at: snapshot.next_attempt_at_ms.and_then(to_utc),
        }
    }
}

fn to_utc(millis: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(i64::try_from(millis).ok()?).single()
}

pub struct CircuitRegistry {
    store: Arc<dyn StateStore>,
    config: CircuitBreakerConfig,
    clock: SharedClock,
}

impl CircuitRegistry {
    pub fn new(
        store: Arc<dyn StateStore>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        Self { store, config, clock }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask for permission to call through `name`
    ///
    /// Fails fast with [`GatewayError::CircuitOpen`] while the circuit is
    /// OPEN, or HALF_OPEN with its trial already in flight.
    pub async fn acquire(&self, name: &str) -> Result<CircuitPermit, GatewayError> {
        let now_ms = self.clock.millis_since_epoch();
        match self.store.circuit_acquire(name, now_ms, &self.config).await? {
            CallAdmission::Granted { trial } => {
                if trial {
                    info!(circuit = name, "circuit half-open; dispatching trial call");
                }
                Ok(CircuitPermit { circuit: name.to_string(), trial })
            }
            CallAdmission::Rejected { state, retry_after } => {
                let retry_after_ms = retry_after.as_millis() as u64;
                debug!(circuit = name, %state, retry_after_ms, "circuit rejected call");
                Err(GatewayError::CircuitOpen {
                    circuit: name.to_string(),
                    state: state.to_string(),
                    retry_after_ms,
                })
            }
        }
    }

    /// Hand back a permit with the outcome of its call
    pub async fn record(
        &self,
        permit: CircuitPermit,
        outcome: CallOutcome,
    ) -> Result<CircuitStatus, GatewayError> {
        let now_ms = self.clock.millis_since_epoch();
        let update = self
            .store
            .circuit_record(&permit.circuit, outcome, permit.trial, now_ms, &self.config)
            .await?;

        if update.changed() {
            match update.current.state {
                CircuitState::Open => warn!(
                    circuit = %permit.circuit,
                    from = %update.previous,
                    consecutive_failures = update.current.consecutive_failures,
                    "circuit opened"
                ),
                state => info!(
                    circuit = %permit.circuit,
                    from = %update.previous,
                    to = %state,
                    "circuit transition"
                ),
            }
        }
        Ok(CircuitStatus::from_snapshot(&permit.circuit, &update.current))
    }

    /// Run `call` through circuit `name`
    ///
    /// The outer error is a rejection (or a store failure); the inner result
    /// is whatever `call` returned. `call` is never invoked when rejected.
    pub async fn execute<T, E, F, Fut>(
        &self,
        name: &str,
        call: F,
    ) -> Result<Result<T, E>, GatewayError>
    where
        E: BreakerOutcome,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire(name).await?;
        let result = call().await;
        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(err) => err.call_outcome(),
        };
        self.record(permit, outcome).await?;
        Ok(result)
    }

    pub async fn state(&self, name: &str) -> Result<CircuitStatus, GatewayError> {
        let snapshot = self.store.circuit_snapshot(name).await?;
        Ok(CircuitStatus::from_snapshot(name, &snapshot))
    }

    pub async fn states(&self) -> Result<Vec<CircuitStatus>, GatewayError> {
        let snapshots = self.store.circuit_snapshots().await?;
        Ok(snapshots
            .iter()
            .map(|(name, snapshot)| CircuitStatus::from_snapshot(name, snapshot))
            .collect())
    }

    pub async fn reset(&self, name: &str) -> Result<(), GatewayError> {
        self.store.circuit_reset(name).await?;
        info!(circuit = name, "circuit manually reset");
        Ok(())
    }
}
