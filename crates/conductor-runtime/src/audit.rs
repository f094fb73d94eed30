//! Append-only audit log. Recording never fails the caller.

use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter};
use tracing::warn;

use conductor_kernel::{sanitize_payload, AuditEntry, AuditFilter, AuditRecord, Clock, KernelError};

use crate::store::{dt_to_ms, from_json_text, ms_to_dt, to_json_text, SqliteStore};

pub const MAX_AUDIT_PAGE: usize = 500;
/// Actor recorded when the caller did not name one.
pub const SYSTEM_ACTOR: &str = "system";

pub(crate) fn actor_or_system(actor: &str) -> &str {
    if actor.trim().is_empty() {
        SYSTEM_ACTOR
    } else {
        actor
    }
}

#[derive(Clone)]
pub struct AuditLog {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Writes one entry with a sanitized payload. Failures are logged and
    /// swallowed; the stored `audit_id` is returned when the write landed.
    pub fn record(&self, record: AuditRecord) -> Option<i64> {
        match self.try_record(&record) {
            Ok(audit_id) => Some(audit_id),
            Err(err) => {
                warn!(
                    action = %record.action,
                    result = %record.result,
                    error = %err,
                    "audit write failed"
                );
                None
            }
        }
    }

    fn try_record(&self, record: &AuditRecord) -> Result<i64, KernelError> {
        let payload = sanitize_payload(&record.payload);
        let error = record
            .error
            .as_ref()
            .map(|e| to_json_text(&sanitize_payload(e), "audit error"))
            .transpose()?;
        let conn = self.store.lock()?;
        conn.execute(
            "INSERT INTO audit_log(timestamp_ms, actor, action, target, result, payload_json, error_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                dt_to_ms(self.clock.now()),
                record.actor,
                record.action,
                record.target,
                record.result,
                to_json_text(&payload, "audit payload")?,
                error,
            ],
        )
        .map_err(|e| KernelError::Storage(format!("insert audit entry: {}", e)))?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest-first entries matching `filter`.
    pub fn list(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditEntry>, KernelError> {
        if limit == 0 || limit > MAX_AUDIT_PAGE {
            return Err(KernelError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_AUDIT_PAGE
            )));
        }
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        for (column, value) in [
            ("action = ?", &filter.action),
            ("result = ?", &filter.result),
            ("target = ?", &filter.target),
        ] {
            if let Some(value) = value {
                clauses.push(column);
                args.push(SqlValue::Text(value.clone()));
            }
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        args.push(SqlValue::Integer(limit as i64));
        let sql = format!(
            "SELECT audit_id, timestamp_ms, actor, action, target, result, payload_json, error_json
             FROM audit_log {} ORDER BY audit_id DESC LIMIT ?",
            where_sql
        );

        let conn = self.store.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| KernelError::Storage(format!("prepare list audit: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .map_err(|e| KernelError::Storage(format!("query audit: {}", e)))?;
        let mut out = Vec::new();
        for row in rows {
            let (audit_id, ts, actor, action, target, result, payload, error) =
                row.map_err(|e| KernelError::Storage(format!("scan audit row: {}", e)))?;
            out.push(AuditEntry {
                audit_id,
                timestamp: ms_to_dt(ts),
                actor,
                action,
                target,
                result,
                payload: from_json_text(&payload, "audit payload")?,
                error: error
                    .as_deref()
                    .map(|text| from_json_text(text, "audit error"))
                    .transpose()?,
            });
        }
        Ok(out)
    }
}
