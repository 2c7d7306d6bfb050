//! Connection health monitor
//!
//! Tracks, per connection pool, the run of consecutive errors, the time of
//! the last success and a window of recent outcomes. The monitor only
//! advises: [`ConnectionHealthMonitor::check`] says whether the pool should
//! be recycled before the next call, and the score is for dashboards.
//!
//! Connections are per process, so this state is deliberately not kept in
//! the shared state store.

use std::collections::VecDeque;

use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use sheetgate_domain::{ConnectionHealthRecord, HealthSettings, HealthSignal};
use tracing::{debug, info, warn};

use crate::SharedClock;

#[derive(Debug)]
struct PoolHealth {
    consecutive_errors: u32,
    last_success_ms: Option<u64>,
    /// Start of the current idle period: last success or last reset
    idle_since_ms: Option<u64>,
    recent: VecDeque<bool>,
    total_successes: u64,
    total_errors: u64,
    resets: u64,
}

impl PoolHealth {
    fn new(window: usize) -> Self {
        Self {
            consecutive_errors: 0,
            last_success_ms: None,
            idle_since_ms: None,
            recent: VecDeque::with_capacity(window),
            total_successes: 0,
            total_errors: 0,
            resets: 0,
        }
    }

    /// Linearly weighted success ratio; the newest outcome weighs most
    fn score(&self) -> u8 {
        if self.recent.is_empty() {
            return 100;
        }
        let (mut earned, mut possible) = (0u64, 0u64);
        for (position, success) in self.recent.iter().enumerate() {
            let weight = position as u64 + 1;
            possible += weight;
            if *success {
                earned += weight;
            }
        }
        ((earned * 100 + possible / 2) / possible) as u8
    }
}

pub struct ConnectionHealthMonitor {
    pools: DashMap<String, PoolHealth>,
    settings: HealthSettings,
    clock: SharedClock,
}

impl ConnectionHealthMonitor {
    pub fn new(settings: HealthSettings, clock: SharedClock) -> Self {
        Self { pools: DashMap::new(), settings, clock }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Record the outcome of one upstream call on `pool`
    pub fn record_outcome(&self, pool: &str, success: bool) {
        let now_ms = self.clock.millis_since_epoch();
        let window = self.settings.window_size.max(1);
        let mut health =
            self.pools.entry(pool.to_string()).or_insert_with(|| PoolHealth::new(window));

        if health.recent.len() >= window {
            health.recent.pop_front();
        }
        health.recent.push_back(success);

        if success {
            if health.consecutive_errors > 0 {
                debug!(pool, errors = health.consecutive_errors, "connection recovered");
            }
            health.consecutive_errors = 0;
            health.last_success_ms = Some(now_ms);
            health.idle_since_ms = Some(now_ms);
            health.total_successes += 1;
        } else {
            health.consecutive_errors = health.consecutive_errors.saturating_add(1);
            health.total_errors += 1;
            if health.consecutive_errors == self.settings.reset_threshold {
                warn!(
                    pool,
                    consecutive_errors = health.consecutive_errors,
                    "connection error threshold reached; pool will be reset before next call"
                );
            }
        }
    }

    /// What `pool` needs before its next call
    pub fn check(&self, pool: &str) -> HealthSignal {
        let now_ms = self.clock.millis_since_epoch();
        self.pools
            .get(pool)
            .map_or(HealthSignal::Healthy, |health| self.signal_for(&health, now_ms))
    }

    /// The pool was recycled: clear the error run and restart the idle timer
    pub fn mark_reset(&self, pool: &str) {
        let now_ms = self.clock.millis_since_epoch();
        let window = self.settings.window_size.max(1);
        let mut health =
            self.pools.entry(pool.to_string()).or_insert_with(|| PoolHealth::new(window));
        health.consecutive_errors = 0;
        health.idle_since_ms = Some(now_ms);
        health.resets += 1;
        info!(pool, resets = health.resets, "connection pool reset");
    }

    /// 0 to 100; unknown pools score 100
    pub fn health_score(&self, pool: &str) -> u8 {
        self.pools.get(pool).map_or(100, |health| health.score())
    }

    pub fn record(&self, pool: &str) -> ConnectionHealthRecord {
        let now_ms = self.clock.millis_since_epoch();
        self.pools
            .get(pool)
            .map_or_else(
                || ConnectionHealthRecord::fresh(pool),
                |health| self.to_record(pool, &health, now_ms),
            )
    }

    /// Records for every pool seen so far, sorted by name
    pub fn snapshot(&self) -> Vec<ConnectionHealthRecord> {
        let now_ms = self.clock.millis_since_epoch();
        let mut records: Vec<_> = self
            .pools
            .iter()
            .map(|entry| self.to_record(entry.key(), entry.value(), now_ms))
            .collect();
        records.sort_by(|a, b| a.pool_name.cmp(&b.pool_name));
        records
    }

    fn signal_for(&self, health: &PoolHealth, now_ms: u64) -> HealthSignal {
        if health.consecutive_errors >= self.settings.reset_threshold {
            return HealthSignal::ResetRequired;
        }
        let idle = health
            .idle_since_ms
            .is_some_and(|since| now_ms.saturating_sub(since) > self.settings.max_idle_ms);
        if idle {
            HealthSignal::RefreshRequired
        } else {
            HealthSignal::Healthy
        }
    }

    fn to_record(&self, pool: &str, health: &PoolHealth, now_ms: u64) -> ConnectionHealthRecord {
        ConnectionHealthRecord {
            pool_name: pool.to_string(),
            consecutive_errors: health.consecutive_errors,
            last_success_at: health
                .last_success_ms
                .and_then(|ms| Utc.timestamp_millis_opt(i64::try_from(ms).ok()?).single()),
            health_score: health.score(),
            signal: self.signal_for(health, now_ms),
            total_successes: health.total_successes,
            total_errors: health.total_errors,
            resets: health.resets,
        }
    }
}
