//! Per-tenant quota ledger
//!
//! Every tenant has, per operation class, three independent counters: one
//! for the current UTC hour, day and month. A call is admitted only if
//! `count + cost` stays within the limit of all three, and then all three
//! are incremented in the same store operation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::RwLock;
use sheetgate_domain::{
    percent_used, GatewayError, OperationClass, QuotaCounterKey, QuotaDemand, QuotaLedgerEntry,
    QuotaPolicy, QuotaWindow, UsageStats,
};
use tracing::{debug, warn};

use crate::state::{QuotaConsumeOutcome, StateStore};
use crate::SharedClock;

/// Counters one admission incremented
///
/// Hand it back to [`QuotaLedger::refund`] when the admitted call never
/// reached the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCharge {
    keys: Vec<QuotaCounterKey>,
    cost: u64,
}

impl QuotaCharge {
    fn none() -> Self {
        Self { keys: Vec::new(), cost: 0 }
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }
}

pub struct QuotaLedger {
    store: Arc<dyn StateStore>,
    policy: RwLock<QuotaPolicy>,
    tenants: DashSet<String>,
    clock: SharedClock,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn StateStore>, policy: QuotaPolicy, clock: SharedClock) -> Self {
        Self { store, policy: RwLock::new(policy), tenants: DashSet::new(), clock }
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy.read().clone()
    }

    /// Replace the tenant quota configuration
    pub fn set_policy(&self, policy: QuotaPolicy) {
        *self.policy.write() = policy;
    }

    /// Tenants that have consumed quota in this process, sorted
    pub fn known_tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.tenants.iter().map(|tenant| tenant.clone()).collect();
        tenants.sort();
        tenants
    }

    /// Check and increment in one atomic step
    pub async fn admit(
        &self,
        tenant_id: &str,
        class: OperationClass,
        cost: u64,
    ) -> Result<QuotaCharge, GatewayError> {
        if cost == 0 {
            return Ok(QuotaCharge::none());
        }
        let now = self.clock.utc_now();
        let demands = self.demands(tenant_id, class, now);

        match self.store.quota_try_consume(&demands, cost).await? {
            QuotaConsumeOutcome::Admitted { counts } => {
                self.tenants.insert(tenant_id.to_string());
                debug!(tenant_id, %class, cost, ?counts, "quota admitted");
                let keys = demands.into_iter().map(|demand| demand.key).collect();
                Ok(QuotaCharge { keys, cost })
            }
            QuotaConsumeOutcome::Rejected { index, count } => {
                let demand = &demands[index];
                let err = self.rejection(tenant_id, demand, now);
                warn!(
                    tenant_id,
                    %class,
                    window = %demand.key.window,
                    count,
                    cost,
                    "quota exceeded"
                );
                Err(err)
            }
        }
    }

    /// Give back a charge for a call that was never dispatched
    ///
    /// Counters whose window has rolled over since the charge are left
    /// alone. A failed refund is logged; the tenant is over-counted, never
    /// under-counted.
    pub async fn refund(&self, charge: QuotaCharge) {
        let Some(first) = charge.keys.first() else {
            return;
        };
        let (tenant_id, class) = (first.tenant_id.as_str(), first.class);
        match self.store.quota_release(&charge.keys, charge.cost).await {
            Ok(()) => debug!(tenant_id, %class, cost = charge.cost, "quota refunded"),
            Err(err) => warn!(tenant_id, %class, error = %err, "quota refund failed"),
        }
    }

    /// Read-only admission check; nothing is incremented
    pub async fn check_quota(
        &self,
        tenant_id: &str,
        class: OperationClass,
        cost: u64,
    ) -> Result<(), GatewayError> {
        let now = self.clock.utc_now();
        let demands = self.demands(tenant_id, class, now);
        let keys: Vec<QuotaCounterKey> = demands.iter().map(|demand| demand.key.clone()).collect();
        let counts = self.store.quota_counts(&keys).await?;

        for (demand, count) in demands.iter().zip(counts) {
            if demand.limit.is_some_and(|limit| count.saturating_add(cost) > limit) {
                return Err(self.rejection(tenant_id, demand, now));
            }
        }
        Ok(())
    }

    /// Record usage after a successful [`check_quota`](Self::check_quota)
    ///
    /// The limit is enforced again inside the store so that a check followed
    /// by a record can never push a count past its limit, even when other
    /// callers recorded in between.
    pub async fn record_usage(
        &self,
        tenant_id: &str,
        class: OperationClass,
        cost: u64,
    ) -> Result<(), GatewayError> {
        self.admit(tenant_id, class, cost).await.map(drop)
    }

    /// Current/limit/percent/next reset per class and window
    pub async fn usage_stats(&self, tenant_id: &str) -> Result<UsageStats, GatewayError> {
        let now = self.clock.utc_now();
        let limits = *self.policy.read().limits_for(tenant_id);

        let mut cells = Vec::with_capacity(OperationClass::ALL.len() * QuotaWindow::ALL.len());
        for class in OperationClass::ALL {
            for window in QuotaWindow::ALL {
                cells.push((class, window, limits.for_class(class).limit(window)));
            }
        }
        let keys: Vec<QuotaCounterKey> = cells
            .iter()
            .map(|(class, window, _)| QuotaCounterKey::new(tenant_id, *class, *window, now))
            .collect();
        let counts = self.store.quota_counts(&keys).await?;

        let entries = cells
            .into_iter()
            .zip(counts)
            .map(|((class, window, limit), count)| QuotaLedgerEntry {
                tenant_id: tenant_id.to_string(),
                operation_class: class,
                window,
                count,
                limit,
                percent_used: percent_used(count, limit),
                reset_at: window.next_reset(now),
            })
            .collect();
        Ok(UsageStats { tenant_id: tenant_id.to_string(), generated_at: now, entries })
    }

    fn demands(
        &self,
        tenant_id: &str,
        class: OperationClass,
        now: DateTime<Utc>,
    ) -> Vec<QuotaDemand> {
        let policy = self.policy.read();
        let limits = policy.limits_for(tenant_id).for_class(class);
        QuotaWindow::ALL
            .iter()
            .map(|window| QuotaDemand {
                key: QuotaCounterKey::new(tenant_id, class, *window, now),
                limit: limits.limit(*window),
            })
            .collect()
    }

    fn rejection(&self, tenant_id: &str, demand: &QuotaDemand, now: DateTime<Utc>) -> GatewayError {
        let reset_time = demand.key.window.next_reset(now);
        let retry_after_ms = u64::try_from((reset_time - now).num_milliseconds()).unwrap_or(0);
        GatewayError::QuotaExceeded {
            tenant_id: tenant_id.to_string(),
            quota_type: format!("{}:{}", demand.key.class, demand.key.window),
            limit: demand.limit.unwrap_or(0),
            reset_time,
            retry_after_ms,
        }
    }
}
