//! Versioned policy blobs with exactly one active version per kind, and the
//! per-lane kill switch stored on top of them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::info;

use conductor_kernel::{
    Clock, ConfigVersion, KernelError, KillSwitchDocument, KillSwitchState, KILL_SWITCH_KIND,
};

use crate::store::{dt_to_ms, from_json_text, ms_to_dt, to_json_text, SqliteStore};

#[derive(Clone)]
pub struct ConfigRegistry {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
}

impl ConfigRegistry {
    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Inserts the next version of `kind` as the active one and clears the
    /// previously active row, in one IMMEDIATE transaction.
    pub fn activate(&self, kind: &str, blob: Value, created_by: &str) -> Result<i64, KernelError> {
        check_kind(kind)?;
        let now = self.clock.now();
        let version = self
            .store
            .with_transaction(|tx| activate_version(tx, kind, &blob, created_by, now))?;
        info!(kind, version, created_by, "config version activated");
        Ok(version)
    }

    /// Activates `blob` only when `kind` has no active version yet. Returns the
    /// active version either way.
    pub fn ensure_default(
        &self,
        kind: &str,
        blob: Value,
        created_by: &str,
    ) -> Result<i64, KernelError> {
        check_kind(kind)?;
        let now = self.clock.now();
        self.store.with_transaction(|tx| {
            if let Some(active) = load_active(tx, kind)? {
                return Ok(active.version);
            }
            activate_version(tx, kind, &blob, created_by, now)
        })
    }

    /// Flips the active flag back to an existing version.
    pub fn reactivate(&self, kind: &str, version: i64) -> Result<(), KernelError> {
        check_kind(kind)?;
        self.store.with_transaction(|tx| {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM config_versions WHERE kind = ?1 AND version = ?2",
                    params![kind, version],
                    |_| Ok(()),
                )
                .optional()
                .map_err(|e| KernelError::Storage(format!("read config version: {}", e)))?;
            if exists.is_none() {
                return Err(KernelError::NotFound(format!(
                    "config {} version {}",
                    kind, version
                )));
            }
            deactivate(tx, kind)?;
            tx.execute(
                "UPDATE config_versions SET is_active = 1 WHERE kind = ?1 AND version = ?2",
                params![kind, version],
            )
            .map_err(|e| KernelError::Storage(format!("reactivate config version: {}", e)))?;
            Ok(())
        })?;
        info!(kind, version, "config version reactivated");
        Ok(())
    }

    pub fn get_active(&self, kind: &str) -> Result<Option<Value>, KernelError> {
        Ok(self.get_active_version(kind)?.map(|v| v.blob))
    }

    pub fn get_active_version(&self, kind: &str) -> Result<Option<ConfigVersion>, KernelError> {
        let conn = self.store.lock()?;
        load_active(&conn, kind)
    }

    /// All versions of `kind`, newest first.
    pub fn list_versions(&self, kind: &str) -> Result<Vec<ConfigVersion>, KernelError> {
        let conn = self.store.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT kind, version, is_active, created_at_ms, created_by, blob_json
                 FROM config_versions WHERE kind = ?1 ORDER BY version DESC",
            )
            .map_err(|e| KernelError::Storage(format!("prepare list config versions: {}", e)))?;
        let rows = stmt
            .query_map(params![kind], ConfigRow::from_row)
            .map_err(|e| KernelError::Storage(format!("query config versions: {}", e)))?;
        let mut out = Vec::new();
        for row in rows {
            let row = row.map_err(|e| KernelError::Storage(format!("scan config row: {}", e)))?;
            out.push(row.into_version()?);
        }
        Ok(out)
    }

    pub(crate) fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

fn check_kind(kind: &str) -> Result<(), KernelError> {
    if kind.trim().is_empty() {
        return Err(KernelError::Validation("config kind must not be blank".to_string()));
    }
    Ok(())
}

fn deactivate(conn: &Connection, kind: &str) -> Result<(), KernelError> {
    conn.execute(
        "UPDATE config_versions SET is_active = 0 WHERE kind = ?1 AND is_active = 1",
        params![kind],
    )
    .map_err(|e| KernelError::Storage(format!("deactivate config version: {}", e)))?;
    Ok(())
}

pub(crate) fn activate_version(
    conn: &Connection,
    kind: &str,
    blob: &Value,
    created_by: &str,
    now: DateTime<Utc>,
) -> Result<i64, KernelError> {
    let next: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM config_versions WHERE kind = ?1",
            params![kind],
            |r| r.get(0),
        )
        .map_err(|e| KernelError::Storage(format!("read next config version: {}", e)))?;
    deactivate(conn, kind)?;
    conn.execute(
        "INSERT INTO config_versions(kind, version, is_active, created_at_ms, created_by, blob_json)
         VALUES (?1, ?2, 1, ?3, ?4, ?5)",
        params![kind, next, dt_to_ms(now), created_by, to_json_text(blob, "config blob")?],
    )
    .map_err(|e| KernelError::Storage(format!("insert config version: {}", e)))?;
    Ok(next)
}

pub(crate) fn load_active(conn: &Connection, kind: &str) -> Result<Option<ConfigVersion>, KernelError> {
    conn.query_row(
        "SELECT kind, version, is_active, created_at_ms, created_by, blob_json
         FROM config_versions WHERE kind = ?1 AND is_active = 1",
        params![kind],
        ConfigRow::from_row,
    )
    .optional()
    .map_err(|e| KernelError::Storage(format!("read active config: {}", e)))?
    .map(ConfigRow::into_version)
    .transpose()
}

struct ConfigRow {
    kind: String,
    version: i64,
    is_active: bool,
    created_at_ms: i64,
    created_by: String,
    blob_json: String,
}

impl ConfigRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            kind: row.get(0)?,
            version: row.get(1)?,
            is_active: row.get::<_, i64>(2)? == 1,
            created_at_ms: row.get(3)?,
            created_by: row.get(4)?,
            blob_json: row.get(5)?,
        })
    }

    fn into_version(self) -> Result<ConfigVersion, KernelError> {
        Ok(ConfigVersion {
            blob: from_json_text(&self.blob_json, "config blob")?,
            kind: self.kind,
            version: self.version,
            is_active: self.is_active,
            created_at: ms_to_dt(self.created_at_ms),
            created_by: self.created_by,
        })
    }
}

/// Per-lane emergency stop. Consulted only when selecting new work.
#[derive(Clone)]
pub struct KillSwitch {
    registry: ConfigRegistry,
}

impl KillSwitch {
    pub fn new(registry: ConfigRegistry) -> Self {
        Self { registry }
    }

    /// Engages or clears the switch of `lane`. The read-modify-activate of the
    /// kill switch document happens in one transaction, so concurrent updates
    /// of different lanes never lose each other.
    pub fn set(
        &self,
        lane: &str,
        engaged: bool,
        reason: &str,
        actor: &str,
    ) -> Result<i64, KernelError> {
        if lane.trim().is_empty() {
            return Err(KernelError::Validation("lane must not be blank".to_string()));
        }
        let now = self.registry.clock().now();
        let version = self.registry.store().with_transaction(|tx| {
            let mut doc = load_active(tx, KILL_SWITCH_KIND)?
                .map(|v| KillSwitchDocument::from_blob(&v.blob))
                .unwrap_or_default();
            doc.set(lane, engaged, reason);
            activate_version(tx, KILL_SWITCH_KIND, &doc.to_blob(), actor, now)
        })?;
        info!(lane, engaged, reason, version, "kill switch updated");
        Ok(version)
    }

    /// Unknown lanes are enabled.
    pub fn status(&self, lane: &str) -> Result<KillSwitchState, KernelError> {
        Ok(self
            .registry
            .get_active(KILL_SWITCH_KIND)?
            .map(|blob| KillSwitchDocument::from_blob(&blob).status(lane))
            .unwrap_or_default())
    }

    pub fn is_engaged(&self, lane: &str) -> Result<bool, KernelError> {
        Ok(self.status(lane)?.engaged)
    }
}
