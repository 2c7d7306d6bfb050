//! SQLite connection manager for the shared state database.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use sheetgate_core::{StoreError, StoreResult};
use tracing::info;

use crate::errors::IntoStoreError;

const SCHEMA_VERSION: i32 = 1;
const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type SqlitePool = Pool<SqliteConnectionManager>;
pub type SqliteConnection = PooledConnection<SqliteConnectionManager>;

/// Pooled connections to one WAL-mode database file
///
/// Several processes on one host may open the same file; WAL mode plus a
/// busy timeout lets their short write transactions queue up instead of
/// failing.
#[derive(Clone)]
pub struct DbManager {
    pool: SqlitePool,
    path: PathBuf,
}

impl DbManager {
    /// Open (creating if needed) the database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P, pool_size: u32) -> StoreResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
        });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(IntoStoreError::into_store_error)?;

        info!(
            db_path = %path.display(),
            max_connections = pool.max_size(),
            "sqlite pool initialised"
        );

        Ok(Self { pool, path })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn get_connection(&self) -> StoreResult<SqliteConnection> {
        self.pool.get().map_err(IntoStoreError::into_store_error)
    }

    /// Ensure the full schema exists on the current database.
    pub fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.get_connection()?;
        conn.execute_batch(SCHEMA_SQL).map_err(IntoStoreError::into_store_error)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at)
             VALUES (?, CAST(strftime('%s','now') AS INTEGER))",
            params![SCHEMA_VERSION],
        )
        .map_err(IntoStoreError::into_store_error)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify the database answers a trivial query.
    pub fn health_check(&self) -> StoreResult<()> {
        let conn = self.get_connection()?;
        let one: i32 = conn
            .query_row("SELECT 1", params![], |row| row.get(0))
            .map_err(IntoStoreError::into_store_error)?;
        if one == 1 {
            Ok(())
        } else {
            Err(StoreError::backend("health check returned an unexpected value"))
        }
    }
}
