//! Run summaries and run state persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use conductor_kernel::{
    Clock, KernelError, NewRun, Page, RunCursor, RunError, RunFilter, RunGraph, RunState,
    RunStateRecord, RunStatus, RunSummary, RUN_SCHEMA_VERSION,
};

use crate::store::{dt_to_ms, from_json_text, ms_to_dt, to_json_text, SqliteStore};

pub const MAX_RUN_PAGE: usize = 200;

const RUN_COLUMNS: &str = "run_id, schema_version, status, env, lane, mode, job_type, requested_by,
    parent_run_id, created_at_ms, started_at_ms, finished_at_ms, last_error_json,
    run_graph_json, params_json";

#[derive(Clone)]
pub struct RunStore {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
}

impl RunStore {
    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn get(&self, run_id: &str) -> Result<Option<RunSummary>, KernelError> {
        let conn = self.store.lock()?;
        load_run(&conn, run_id)
    }

    pub fn get_state(&self, run_id: &str) -> Result<Option<RunStateRecord>, KernelError> {
        let conn = self.store.lock()?;
        load_state(&conn, run_id)
    }

    pub fn exists(&self, run_id: &str) -> Result<bool, KernelError> {
        let conn = self.store.lock()?;
        run_exists(&conn, run_id)
    }

    /// Newest-first page ordered by `(created_at, run_id)` descending.
    pub fn list(
        &self,
        filter: &RunFilter,
        cursor: Option<&RunCursor>,
        limit: usize,
    ) -> Result<Page<RunSummary>, KernelError> {
        if limit == 0 || limit > MAX_RUN_PAGE {
            return Err(KernelError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_RUN_PAGE
            )));
        }
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(env) = &filter.env {
            clauses.push("env = ?");
            args.push(SqlValue::Text(env.clone()));
        }
        if let Some(lane) = &filter.lane {
            clauses.push("lane = ?");
            args.push(SqlValue::Text(lane.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            args.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(job_type) = &filter.job_type {
            clauses.push("job_type = ?");
            args.push(SqlValue::Text(job_type.clone()));
        }
        if let Some(requested_by) = &filter.requested_by {
            clauses.push("instr(requested_by, ?) > 0");
            args.push(SqlValue::Text(requested_by.clone()));
        }
        if let Some(cursor) = cursor {
            clauses.push("(created_at_ms < ? OR (created_at_ms = ? AND run_id < ?))");
            args.push(SqlValue::Integer(cursor.created_at_ms));
            args.push(SqlValue::Integer(cursor.created_at_ms));
            args.push(SqlValue::Text(cursor.run_id.clone()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        args.push(SqlValue::Integer((limit + 1) as i64));
        let sql = format!(
            "SELECT {} FROM runs {} ORDER BY created_at_ms DESC, run_id DESC LIMIT ?",
            RUN_COLUMNS, where_sql
        );

        let conn = self.store.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| KernelError::Storage(format!("prepare list runs: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(args), RunRow::from_row)
            .map_err(|e| KernelError::Storage(format!("query list runs: {}", e)))?;
        let mut items = Vec::new();
        for row in rows {
            let row = row.map_err(|e| KernelError::Storage(format!("scan run row: {}", e)))?;
            items.push(row.into_summary()?);
        }
        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| {
                RunCursor {
                    created_at_ms: dt_to_ms(last.created_at),
                    run_id: last.run_id.clone(),
                }
                .encode()
            })
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    /// Non-terminal runs of `(env, lane)` not covered by a live lease, oldest first.
    pub fn runnable_run_ids(&self, env: &str, lane: &str) -> Result<Vec<String>, KernelError> {
        let now = self.clock.now();
        let conn = self.store.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT r.run_id FROM runs r
                 WHERE r.env = ?1 AND r.lane = ?2 AND r.status IN ('pending', 'running')
                   AND NOT EXISTS (
                     SELECT 1 FROM run_leases l
                     WHERE l.run_id = r.run_id AND l.expires_at_ms > ?3
                   )
                 ORDER BY r.created_at_ms ASC, r.run_id ASC",
            )
            .map_err(|e| KernelError::Storage(format!("prepare runnable runs: {}", e)))?;
        let rows = stmt
            .query_map(params![env, lane, dt_to_ms(now)], |r| r.get::<_, String>(0))
            .map_err(|e| KernelError::Storage(format!("query runnable runs: {}", e)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| KernelError::Storage(format!("scan runnable run: {}", e)))?);
        }
        Ok(out)
    }
}

pub(crate) fn run_exists(conn: &Connection, run_id: &str) -> Result<bool, KernelError> {
    conn.query_row(
        "SELECT 1 FROM runs WHERE run_id = ?1",
        params![run_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| KernelError::Storage(format!("check run exists: {}", e)))
}

/// Writes the run row and its empty state row.
pub(crate) fn insert_run(
    conn: &Connection,
    run_id: &str,
    new_run: &NewRun,
    now: DateTime<Utc>,
) -> Result<RunSummary, KernelError> {
    let graph_json = serde_json::to_string(&new_run.run_graph)
        .map_err(|e| KernelError::Storage(format!("encode run graph: {}", e)))?;
    conn.execute(
        "INSERT INTO runs(run_id, schema_version, status, env, lane, mode, job_type,
           requested_by, parent_run_id, created_at_ms, started_at_ms, finished_at_ms,
           last_error_json, run_graph_json, params_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, NULL, NULL, ?11, ?12)",
        params![
            run_id,
            RUN_SCHEMA_VERSION,
            RunStatus::Pending.as_str(),
            new_run.env,
            new_run.lane,
            new_run.mode,
            new_run.job_type,
            new_run.requested_by,
            new_run.parent_run_id,
            dt_to_ms(now),
            graph_json,
            to_json_text(&new_run.params, "run params")?,
        ],
    )
    .map_err(|e| KernelError::Storage(format!("insert run: {}", e)))?;
    save_state(conn, run_id, &RunState::default(), now)?;
    Ok(RunSummary {
        run_id: run_id.to_string(),
        schema_version: RUN_SCHEMA_VERSION.to_string(),
        status: RunStatus::Pending,
        env: new_run.env.clone(),
        lane: new_run.lane.clone(),
        mode: new_run.mode.clone(),
        job_type: new_run.job_type.clone(),
        requested_by: new_run.requested_by.clone(),
        parent_run_id: new_run.parent_run_id.clone(),
        created_at: ms_to_dt(dt_to_ms(now)),
        started_at: None,
        finished_at: None,
        last_error: None,
        run_graph: new_run.run_graph.clone(),
        params: new_run.params.clone(),
    })
}

pub(crate) fn load_run(conn: &Connection, run_id: &str) -> Result<Option<RunSummary>, KernelError> {
    let sql = format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS);
    conn.query_row(&sql, params![run_id], RunRow::from_row)
        .optional()
        .map_err(|e| KernelError::Storage(format!("read run: {}", e)))?
        .map(RunRow::into_summary)
        .transpose()
}

/// Persists status, timing and `last_error` of a run.
pub(crate) fn update_run_progress(conn: &Connection, run: &RunSummary) -> Result<(), KernelError> {
    let last_error = run
        .last_error
        .as_ref()
        .map(|err| {
            serde_json::to_string(err)
                .map_err(|e| KernelError::Storage(format!("encode last_error: {}", e)))
        })
        .transpose()?;
    let updated = conn
        .execute(
            "UPDATE runs
             SET status = ?2, started_at_ms = ?3, finished_at_ms = ?4, last_error_json = ?5
             WHERE run_id = ?1",
            params![
                run.run_id,
                run.status.as_str(),
                run.started_at.map(dt_to_ms),
                run.finished_at.map(dt_to_ms),
                last_error,
            ],
        )
        .map_err(|e| KernelError::Storage(format!("update run: {}", e)))?;
    if updated == 0 {
        return Err(KernelError::NotFound(format!("run {}", run.run_id)));
    }
    Ok(())
}

pub(crate) fn load_state(
    conn: &Connection,
    run_id: &str,
) -> Result<Option<RunStateRecord>, KernelError> {
    let row = conn
        .query_row(
            "SELECT state_json, updated_at_ms FROM run_states WHERE run_id = ?1",
            params![run_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
        )
        .optional()
        .map_err(|e| KernelError::Storage(format!("read run state: {}", e)))?;
    row.map(|(state_json, updated_at_ms)| {
        Ok(RunStateRecord {
            run_id: run_id.to_string(),
            state: from_json_text(&state_json, "run state")?,
            updated_at: ms_to_dt(updated_at_ms),
        })
    })
    .transpose()
}

pub(crate) fn save_state(
    conn: &Connection,
    run_id: &str,
    state: &RunState,
    now: DateTime<Utc>,
) -> Result<(), KernelError> {
    let state_json = serde_json::to_string(state)
        .map_err(|e| KernelError::Storage(format!("encode run state: {}", e)))?;
    conn.execute(
        "INSERT INTO run_states(run_id, state_json, updated_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT(run_id) DO UPDATE SET
           state_json = excluded.state_json,
           updated_at_ms = excluded.updated_at_ms",
        params![run_id, state_json, dt_to_ms(now)],
    )
    .map_err(|e| KernelError::Storage(format!("save run state: {}", e)))?;
    Ok(())
}

struct RunRow {
    run_id: String,
    schema_version: String,
    status: String,
    env: String,
    lane: String,
    mode: String,
    job_type: String,
    requested_by: String,
    parent_run_id: Option<String>,
    created_at_ms: i64,
    started_at_ms: Option<i64>,
    finished_at_ms: Option<i64>,
    last_error_json: Option<String>,
    run_graph_json: String,
    params_json: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            schema_version: row.get(1)?,
            status: row.get(2)?,
            env: row.get(3)?,
            lane: row.get(4)?,
            mode: row.get(5)?,
            job_type: row.get(6)?,
            requested_by: row.get(7)?,
            parent_run_id: row.get(8)?,
            created_at_ms: row.get(9)?,
            started_at_ms: row.get(10)?,
            finished_at_ms: row.get(11)?,
            last_error_json: row.get(12)?,
            run_graph_json: row.get(13)?,
            params_json: row.get(14)?,
        })
    }

    fn into_summary(self) -> Result<RunSummary, KernelError> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| {
            KernelError::Storage(format!(
                "run {} has unknown status '{}'",
                self.run_id, self.status
            ))
        })?;
        let last_error = self
            .last_error_json
            .as_deref()
            .map(|text| from_json_text::<RunError>(text, "last_error"))
            .transpose()?;
        let run_graph: RunGraph = from_json_text(&self.run_graph_json, "run graph")?;
        Ok(RunSummary {
            run_id: self.run_id,
            schema_version: self.schema_version,
            status,
            env: self.env,
            lane: self.lane,
            mode: self.mode,
            job_type: self.job_type,
            requested_by: self.requested_by,
            parent_run_id: self.parent_run_id,
            created_at: ms_to_dt(self.created_at_ms),
            started_at: self.started_at_ms.map(ms_to_dt),
            finished_at: self.finished_at_ms.map(ms_to_dt),
            last_error,
            run_graph,
            params: from_json_text(&self.params_json, "run params")?,
        })
    }
}
