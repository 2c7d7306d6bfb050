//! SQLite-backed [`StateStore`]
//!
//! Quota counters and circuit snapshots live in one WAL-mode database file
//! so that every gateway process on the host sees the same state. Each
//! check-and-update runs inside a single `BEGIN IMMEDIATE` transaction, which
//! takes the write lock up front: two processes can never both read a count
//! below the limit and both increment it. Calls hop to the blocking pool
//! with `spawn_blocking`.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use sheetgate_common::{CallAdmission, CallOutcome, CircuitBreakerConfig, CircuitSnapshot};
use sheetgate_core::{
    CircuitUpdate, QuotaConsumeOutcome, StateStore, StoreDescriptor, StoreError, StoreResult,
};
use sheetgate_domain::{QuotaCounterKey, QuotaDemand};
use tracing::debug;

use super::manager::{DbManager, SqliteConnection};
use crate::errors::IntoStoreError;

fn scope_of(key: &QuotaCounterKey) -> String {
    format!("{}|{}", key.tenant_id, key.class)
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn sql<T>(result: rusqlite::Result<T>) -> StoreResult<T> {
    result.map_err(IntoStoreError::into_store_error)
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[derive(Clone)]
pub struct SqliteStateStore {
    db: DbManager,
}

impl SqliteStateStore {
    /// Open the database at `path` and make sure the schema exists
    pub fn open<P: AsRef<Path>>(path: P, pool_size: u32) -> StoreResult<Self> {
        let db = DbManager::new(path, pool_size)?;
        db.run_migrations()?;
        Ok(Self { db })
    }

    pub fn manager(&self) -> &DbManager {
        &self.db
    }

    /// Run `work` on a pooled connection off the async runtime
    async fn blocking<T, F>(&self, work: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> StoreResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get_connection()?;
            work(&mut conn)
        })
        .await
        .map_err(IntoStoreError::into_store_error)?
    }

    fn counter(tx: &Transaction<'_>, scope: &str, key: &QuotaCounterKey) -> StoreResult<u64> {
        let row: Option<(String, i64)> = sql(tx
            .query_row(
                "SELECT bucket, count FROM quota_counters WHERE scope = ?1 AND quota_window = ?2",
                params![scope, key.window.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional())?;
        // Bucket labels sort chronologically; a stored newer window wins
        Ok(match row {
            Some((bucket, count)) if bucket >= key.bucket => from_sql_count(count),
            _ => 0,
        })
    }

    fn load_circuit(tx: &Transaction<'_>, name: &str) -> StoreResult<CircuitSnapshot> {
        let raw: Option<String> = sql(tx
            .query_row("SELECT snapshot FROM circuits WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .optional())?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).map_err(IntoStoreError::into_store_error),
            None => Ok(CircuitSnapshot::default()),
        }
    }

    fn save_circuit(
        tx: &Transaction<'_>,
        name: &str,
        snapshot: &CircuitSnapshot,
    ) -> StoreResult<()> {
        let raw = serde_json::to_string(snapshot).map_err(IntoStoreError::into_store_error)?;
        sql(tx.execute(
            "INSERT INTO circuits (name, state, snapshot, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET state = excluded.state, snapshot = excluded.snapshot,
             updated_at = excluded.updated_at",
            params![name, snapshot.state.to_string(), raw, now_secs()],
        ))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    fn descriptor(&self) -> StoreDescriptor {
        StoreDescriptor {
            backend: "sqlite".to_string(),
            shared: true,
            location: Some(self.db.path().display().to_string()),
        }
    }

    async fn quota_try_consume(
        &self,
        demands: &[QuotaDemand],
        cost: u64,
    ) -> StoreResult<QuotaConsumeOutcome> {
        let Some(first) = demands.first() else {
            return Ok(QuotaConsumeOutcome::Admitted { counts: Vec::new() });
        };
        let scope = scope_of(&first.key);
        if demands.iter().any(|demand| scope_of(&demand.key) != scope) {
            return Err(StoreError::InvalidRequest {
                message: "quota demands span more than one tenant and class".to_string(),
            });
        }

        let demands = demands.to_vec();
        self.blocking(move |conn| {
            let tx = sql(conn.transaction_with_behavior(TransactionBehavior::Immediate))?;
            let mut current = Vec::with_capacity(demands.len());
            for (index, demand) in demands.iter().enumerate() {
                let count = Self::counter(&tx, &scope, &demand.key)?;
                if demand.limit.is_some_and(|limit| count.saturating_add(cost) > limit) {
                    // dropping `tx` rolls back; nothing was written
                    return Ok(QuotaConsumeOutcome::Rejected { index, count });
                }
                current.push(count);
            }

            let mut counts = Vec::with_capacity(demands.len());
            for (demand, count) in demands.iter().zip(current) {
                let updated = count.saturating_add(cost);
                sql(tx.execute(
                    "INSERT INTO quota_counters (scope, quota_window, bucket, count, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(scope, quota_window) DO UPDATE
                     SET bucket = MAX(quota_counters.bucket, excluded.bucket),
                     count = excluded.count, updated_at = excluded.updated_at",
                    params![
                        scope,
                        demand.key.window.as_str(),
                        demand.key.bucket,
                        to_sql_count(updated),
                        now_secs()
                    ],
                ))?;
                counts.push(updated);
            }
            sql(tx.commit())?;
            Ok(QuotaConsumeOutcome::Admitted { counts })
        })
        .await
    }

    async fn quota_release(&self, keys: &[QuotaCounterKey], cost: u64) -> StoreResult<()> {
        let keys = keys.to_vec();
        self.blocking(move |conn| {
            let tx = sql(conn.transaction_with_behavior(TransactionBehavior::Immediate))?;
            for key in &keys {
                sql(tx.execute(
                    "UPDATE quota_counters SET count = MAX(count - ?1, 0), updated_at = ?2
                     WHERE scope = ?3 AND quota_window = ?4 AND bucket = ?5",
                    params![
                        to_sql_count(cost),
                        now_secs(),
                        scope_of(key),
                        key.window.as_str(),
                        key.bucket
                    ],
                ))?;
            }
            sql(tx.commit())
        })
        .await
    }

    async fn quota_counts(&self, keys: &[QuotaCounterKey]) -> StoreResult<Vec<u64>> {
        let keys = keys.to_vec();
        self.blocking(move |conn| {
            let tx = sql(conn.transaction_with_behavior(TransactionBehavior::Deferred))?;
            keys.iter().map(|key| Self::counter(&tx, &scope_of(key), key)).collect()
        })
        .await
    }

    async fn circuit_acquire(
        &self,
        name: &str,
        now_ms: u64,
        config: &CircuitBreakerConfig,
    ) -> StoreResult<CallAdmission> {
        let name = name.to_string();
        let config = config.clone();
        self.blocking(move |conn| {
            let tx = sql(conn.transaction_with_behavior(TransactionBehavior::Immediate))?;
            let mut snapshot = Self::load_circuit(&tx, &name)?;
            let before = snapshot.clone();
            let admission = snapshot.try_acquire(now_ms, &config);
            if snapshot != before {
                Self::save_circuit(&tx, &name, &snapshot)?;
                sql(tx.commit())?;
            }
            Ok(admission)
        })
        .await
    }

    async fn circuit_record(
        &self,
        name: &str,
        outcome: CallOutcome,
        trial: bool,
        now_ms: u64,
        config: &CircuitBreakerConfig,
    ) -> StoreResult<CircuitUpdate> {
        let name = name.to_string();
        let config = config.clone();
        self.blocking(move |conn| {
            let tx = sql(conn.transaction_with_behavior(TransactionBehavior::Immediate))?;
            let mut snapshot = Self::load_circuit(&tx, &name)?;
            let previous = snapshot.state;
            snapshot.record(outcome, trial, now_ms, &config);
            Self::save_circuit(&tx, &name, &snapshot)?;
            sql(tx.commit())?;
            if previous != snapshot.state {
                debug!(
                    circuit = %name,
                    from = %previous,
                    to = %snapshot.state,
                    "persisted circuit transition"
                );
            }
            Ok(CircuitUpdate { previous, current: snapshot })
        })
        .await
    }

    async fn circuit_snapshot(&self, name: &str) -> StoreResult<CircuitSnapshot> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let tx = sql(conn.transaction_with_behavior(TransactionBehavior::Deferred))?;
            Self::load_circuit(&tx, &name)
        })
        .await
    }

    async fn circuit_snapshots(&self) -> StoreResult<Vec<(String, CircuitSnapshot)>> {
        self.blocking(|conn| {
            let mut stmt = sql(conn.prepare("SELECT name, snapshot FROM circuits ORDER BY name"))?;
            let rows = sql(stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            }))?;
            let mut all = Vec::new();
            for row in rows {
                let (name, raw) = sql(row)?;
                let snapshot =
                    serde_json::from_str(&raw).map_err(IntoStoreError::into_store_error)?;
                all.push((name, snapshot));
            }
            Ok(all)
        })
        .await
    }

    async fn circuit_reset(&self, name: &str) -> StoreResult<()> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let tx = sql(conn.transaction_with_behavior(TransactionBehavior::Immediate))?;
            Self::save_circuit(&tx, &name, &CircuitSnapshot::default())?;
            sql(tx.commit())
        })
        .await
    }
}
