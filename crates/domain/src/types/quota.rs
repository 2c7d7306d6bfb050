//! Quota windows, limits and usage reports

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, Months, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::action::OperationClass;
use crate::constants::{DEFAULT_ADMIN_LIMITS, DEFAULT_READ_LIMITS, DEFAULT_WRITE_LIMITS};

/// Fixed, calendar-aligned (UTC) accounting period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindow {
    Hourly,
    Daily,
    Monthly,
}

impl QuotaWindow {
    pub const ALL: [Self; 3] = [Self::Hourly, Self::Daily, Self::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    /// First instant of the window containing `now`
    pub fn window_start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let start = match self {
            Self::Hourly => date.and_hms_opt(now.hour(), 0, 0),
            Self::Daily => date.and_hms_opt(0, 0, 0),
            Self::Monthly => date.with_day(1).and_then(|first| first.and_hms_opt(0, 0, 0)),
        };
        start.map_or(now, |naive| naive.and_utc())
    }

    /// First instant of the next window, when counters reset
    pub fn next_reset(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.window_start(now);
        match self {
            Self::Hourly => start + Duration::hours(1),
            Self::Daily => start + Duration::days(1),
            Self::Monthly => {
                start.checked_add_months(Months::new(1)).unwrap_or(start + Duration::days(31))
            }
        }
    }

    /// Stable label of the window containing `now`, used as part of the
    /// counter key so a new window is a new counter
    pub fn bucket_label(self, now: DateTime<Utc>) -> String {
        let start = self.window_start(now);
        match self {
            Self::Hourly => start.format("%Y-%m-%dT%H").to_string(),
            Self::Daily => start.format("%Y-%m-%d").to_string(),
            Self::Monthly => start.format("%Y-%m").to_string(),
        }
    }
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits for one class across the three windows; `None` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowLimits {
    pub hourly: Option<u64>,
    pub daily: Option<u64>,
    pub monthly: Option<u64>,
}

impl WindowLimits {
    pub const fn new(hourly: u64, daily: u64, monthly: u64) -> Self {
        Self { hourly: Some(hourly), daily: Some(daily), monthly: Some(monthly) }
    }

    pub const fn unlimited() -> Self {
        Self { hourly: None, daily: None, monthly: None }
    }

    pub fn limit(&self, window: QuotaWindow) -> Option<u64> {
        match window {
            QuotaWindow::Hourly => self.hourly,
            QuotaWindow::Daily => self.daily,
            QuotaWindow::Monthly => self.monthly,
        }
    }
}

/// Limits for every class of one tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub read: WindowLimits,
    pub write: WindowLimits,
    pub admin: WindowLimits,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        let (rh, rd, rm) = DEFAULT_READ_LIMITS;
        let (wh, wd, wm) = DEFAULT_WRITE_LIMITS;
        let (ah, ad, am) = DEFAULT_ADMIN_LIMITS;
        Self {
            read: WindowLimits::new(rh, rd, rm),
            write: WindowLimits::new(wh, wd, wm),
            admin: WindowLimits::new(ah, ad, am),
        }
    }
}

impl QuotaLimits {
    pub fn for_class(&self, class: OperationClass) -> &WindowLimits {
        match class {
            OperationClass::Read => &self.read,
            OperationClass::Write => &self.write,
            OperationClass::Admin => &self.admin,
        }
    }

    pub fn for_class_mut(&mut self, class: OperationClass) -> &mut WindowLimits {
        match class {
            OperationClass::Read => &mut self.read,
            OperationClass::Write => &mut self.write,
            OperationClass::Admin => &mut self.admin,
        }
    }
}

/// Per-tenant quota configuration, supplied by the tenant collaborator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    pub defaults: QuotaLimits,
    pub tenants: HashMap<String, QuotaLimits>,
}

impl QuotaPolicy {
    pub fn limits_for(&self, tenant_id: &str) -> &QuotaLimits {
        self.tenants.get(tenant_id).unwrap_or(&self.defaults)
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>, limits: QuotaLimits) -> Self {
        self.tenants.insert(tenant_id.into(), limits);
        self
    }
}

/// Address of one counter: tenant × class × window instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaCounterKey {
    pub tenant_id: String,
    pub class: OperationClass,
    pub window: QuotaWindow,
    /// Label of the window instance (see [`QuotaWindow::bucket_label`])
    pub bucket: String,
}

impl QuotaCounterKey {
    pub fn new(
        tenant_id: &str,
        class: OperationClass,
        window: QuotaWindow,
        now: DateTime<Utc>,
    ) -> Self {
        Self { tenant_id: tenant_id.to_string(), class, window, bucket: window.bucket_label(now) }
    }

    /// Flat string form for key-value stores
    pub fn storage_key(&self) -> String {
        format!("{}|{}|{}:{}", self.tenant_id, self.class, self.window, self.bucket)
    }
}

/// A counter check-and-increment request against one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDemand {
    pub key: QuotaCounterKey,
    pub limit: Option<u64>,
}

/// Current state of one counter, for dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLedgerEntry {
    pub tenant_id: String,
    pub operation_class: OperationClass,
    pub window: QuotaWindow,
    pub count: u64,
    pub limit: Option<u64>,
    pub percent_used: f64,
    pub reset_at: DateTime<Utc>,
}

/// Usage report for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub tenant_id: String,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<QuotaLedgerEntry>,
}

impl UsageStats {
    pub fn entry(&self, class: OperationClass, window: QuotaWindow) -> Option<&QuotaLedgerEntry> {
        self.entries.iter().find(|entry| entry.operation_class == class && entry.window == window)
    }
}

/// Percentage of `limit` consumed; 0 for unlimited windows
pub fn percent_used(count: u64, limit: Option<u64>) -> f64 {
    match limit {
        Some(0) => 100.0,
        Some(limit) => (count as f64 / limit as f64 * 100.0).min(100.0),
        None => 0.0,
    }
}
