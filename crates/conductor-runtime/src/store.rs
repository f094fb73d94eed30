//! Shared SQLite storage handle and schema migrations.
//!
//! Every component receives a clone of one [SqliteStore]. Multi-row mutations go
//! through [SqliteStore::with_transaction], which opens an IMMEDIATE transaction
//! so concurrent writers on the same database file queue on `busy_timeout`
//! instead of failing on lock upgrade.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::debug;

use conductor_kernel::KernelError;

pub(crate) const SQLITE_SCHEMA_VERSION: i64 = 3;

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

pub(crate) fn to_json_text(value: &serde_json::Value, what: &str) -> Result<String, KernelError> {
    serde_json::to_string(value).map_err(|e| KernelError::Storage(format!("encode {}: {}", what, e)))
}

pub(crate) fn from_json_text<T: serde::de::DeserializeOwned>(
    text: &str,
    what: &str,
) -> Result<T, KernelError> {
    serde_json::from_str(text).map_err(|e| KernelError::Storage(format!("decode {}: {}", what, e)))
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and applies pending migrations.
    /// `":memory:"` gives a private in-memory database.
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self, KernelError> {
        let conn = Connection::open(path)
            .map_err(|e| KernelError::Storage(format!("open sqlite store {}: {}", path, e)))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| KernelError::Storage(format!("set busy timeout: {}", e)))?;
        if path != ":memory:" {
            conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get::<_, String>(0))
                .map_err(|e| KernelError::Storage(format!("enable wal: {}", e)))?;
        }
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_string(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, KernelError> {
        Self::open(":memory:", Duration::from_millis(5_000))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, KernelError> {
        self.conn
            .lock()
            .map_err(|_| KernelError::Storage("sqlite store lock poisoned".to_string()))
    }

    /// Runs `f` against the raw connection outside of any transaction.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T, KernelError>
    where
        F: FnOnce(&Connection) -> Result<T, KernelError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Runs `f` inside one IMMEDIATE transaction. Any error rolls everything back.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T, KernelError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, KernelError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| KernelError::Storage(format!("begin tx: {}", e)))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| KernelError::Storage(format!("commit tx: {}", e)))?;
        Ok(value)
    }

    fn ensure_schema(&self) -> Result<(), KernelError> {
        self.with_transaction(|tx| {
            ensure_sqlite_migration_table(tx)?;
            let current = sqlite_current_schema_version(tx)?;
            if current > SQLITE_SCHEMA_VERSION {
                return Err(KernelError::Storage(format!(
                    "sqlite schema version {} is newer than supported {}",
                    current, SQLITE_SCHEMA_VERSION
                )));
            }
            if current < 1 {
                apply_sqlite_migration_v1(tx)?;
                record_sqlite_migration(tx, 1, "baseline_run_tables")?;
            }
            if current < 2 {
                apply_sqlite_migration_v2(tx)?;
                record_sqlite_migration(tx, 2, "config_versions_and_audit_log")?;
            }
            if current < 3 {
                apply_sqlite_migration_v3(tx)?;
                record_sqlite_migration(tx, 3, "daily_counters")?;
            }
            if current < SQLITE_SCHEMA_VERSION {
                debug!(from = current, to = SQLITE_SCHEMA_VERSION, "sqlite schema migrated");
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

fn ensure_sqlite_migration_table(conn: &Connection) -> Result<(), KernelError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| KernelError::Storage(format!("init sqlite migration table: {}", e)))?;
    Ok(())
}

fn sqlite_current_schema_version(conn: &Connection) -> Result<i64, KernelError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |r| r.get(0),
    )
    .map_err(|e| KernelError::Storage(format!("read sqlite schema version: {}", e)))
}

fn record_sqlite_migration(conn: &Connection, version: i64, name: &str) -> Result<(), KernelError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at_ms)
         VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| KernelError::Storage(format!("record sqlite migration: {}", e)))?;
    Ok(())
}

fn apply_sqlite_migration_v1(conn: &Connection) -> Result<(), KernelError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
          run_id TEXT PRIMARY KEY,
          schema_version TEXT NOT NULL,
          status TEXT NOT NULL,
          env TEXT NOT NULL,
          lane TEXT NOT NULL,
          mode TEXT NOT NULL,
          job_type TEXT NOT NULL,
          requested_by TEXT NOT NULL,
          parent_run_id TEXT NULL,
          created_at_ms INTEGER NOT NULL,
          started_at_ms INTEGER NULL,
          finished_at_ms INTEGER NULL,
          last_error_json TEXT NULL,
          run_graph_json TEXT NOT NULL,
          params_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_runs_lane_fifo
          ON runs(env, lane, status, created_at_ms, run_id);
        CREATE INDEX IF NOT EXISTS idx_runs_created
          ON runs(created_at_ms, run_id);
        CREATE TABLE IF NOT EXISTS run_states (
          run_id TEXT PRIMARY KEY,
          state_json TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS run_events (
          sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_id TEXT NOT NULL,
          timestamp_ms INTEGER NOT NULL,
          event_type TEXT NOT NULL,
          payload_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_run_events_order
          ON run_events(run_id, timestamp_ms, sequence_id);
        CREATE TABLE IF NOT EXISTS run_leases (
          run_id TEXT PRIMARY KEY,
          owner_id TEXT NOT NULL,
          acquired_at_ms INTEGER NOT NULL,
          renewed_at_ms INTEGER NOT NULL,
          expires_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_run_leases_expiry
          ON run_leases(expires_at_ms);
        "#,
    )
    .map_err(|e| KernelError::Storage(format!("apply sqlite migration v1: {}", e)))?;
    Ok(())
}

fn apply_sqlite_migration_v2(conn: &Connection) -> Result<(), KernelError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS config_versions (
          kind TEXT NOT NULL,
          version INTEGER NOT NULL,
          is_active INTEGER NOT NULL DEFAULT 0,
          created_at_ms INTEGER NOT NULL,
          created_by TEXT NOT NULL,
          blob_json TEXT NOT NULL,
          PRIMARY KEY (kind, version)
        );
        CREATE UNIQUE INDEX IF NOT EXISTS ux_config_versions_active
          ON config_versions(kind) WHERE is_active = 1;
        CREATE TABLE IF NOT EXISTS audit_log (
          audit_id INTEGER PRIMARY KEY AUTOINCREMENT,
          timestamp_ms INTEGER NOT NULL,
          actor TEXT NOT NULL,
          action TEXT NOT NULL,
          target TEXT NULL,
          result TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          error_json TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_log_action
          ON audit_log(action, audit_id);
        "#,
    )
    .map_err(|e| KernelError::Storage(format!("apply sqlite migration v2: {}", e)))?;
    Ok(())
}

fn apply_sqlite_migration_v3(conn: &Connection) -> Result<(), KernelError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS daily_counters (
          day TEXT NOT NULL,
          scope TEXT NOT NULL,
          scope_id TEXT NOT NULL,
          counter_key TEXT NOT NULL,
          value INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          PRIMARY KEY (day, scope, scope_id, counter_key)
        );
        "#,
    )
    .map_err(|e| KernelError::Storage(format!("apply sqlite migration v3: {}", e)))?;
    Ok(())
}
