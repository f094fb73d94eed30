//! Per-UTC-day counters keyed by lane or run.

use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

use conductor_kernel::{Clock, KernelError};

use crate::store::{dt_to_ms, SqliteStore};

pub const TICKS_KEY: &str = "ticks";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CounterScope {
    Lane,
    Run,
}

impl CounterScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lane => "lane",
            Self::Run => "run",
        }
    }
}

#[derive(Clone)]
pub struct DailyCounters {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
}

impl DailyCounters {
    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Current UTC day of the injected clock.
    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Single UPSERT; returns the new value.
    pub fn increment(
        &self,
        day: NaiveDate,
        scope: CounterScope,
        scope_id: &str,
        key: &str,
        by: i64,
    ) -> Result<i64, KernelError> {
        let now = self.clock.now();
        let conn = self.store.lock()?;
        conn.query_row(
            "INSERT INTO daily_counters(day, scope, scope_id, counter_key, value, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(day, scope, scope_id, counter_key) DO UPDATE SET
               value = daily_counters.value + excluded.value,
               updated_at_ms = excluded.updated_at_ms
             RETURNING value",
            params![day.to_string(), scope.as_str(), scope_id, key, by, dt_to_ms(now)],
            |r| r.get(0),
        )
        .map_err(|e| KernelError::Storage(format!("increment daily counter: {}", e)))
    }

    /// 0 when the counter has not been touched that day.
    pub fn get(
        &self,
        day: NaiveDate,
        scope: CounterScope,
        scope_id: &str,
        key: &str,
    ) -> Result<i64, KernelError> {
        let conn = self.store.lock()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM daily_counters
                 WHERE day = ?1 AND scope = ?2 AND scope_id = ?3 AND counter_key = ?4",
                params![day.to_string(), scope.as_str(), scope_id, key],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| KernelError::Storage(format!("read daily counter: {}", e)))?;
        Ok(value.unwrap_or(0))
    }

    pub fn ticks_today(&self, scope: CounterScope, scope_id: &str) -> Result<i64, KernelError> {
        self.get(self.today(), scope, scope_id, TICKS_KEY)
    }
}
