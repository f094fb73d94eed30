//! Per-run leases.
//!
//! Acquire is a single conditional UPSERT: the row is written only when no
//! lease exists or the existing one has expired. Two owners can therefore
//! never both observe success for the same run while a lease is live.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use conductor_kernel::{Clock, KernelError, LeaseRecord};

use crate::store::{dt_to_ms, ms_to_dt, SqliteStore};

/// Lease manager abstraction. `Ok(false)` from acquire/renew is a normal
/// outcome, not an error.
pub trait LeaseManager: Send + Sync {
    fn acquire(&self, run_id: &str, owner_id: &str, ttl: Duration) -> Result<bool, KernelError>;
    fn renew(&self, run_id: &str, owner_id: &str, ttl: Duration) -> Result<bool, KernelError>;
    /// Returns whether a lease row was removed; a non-owner release is a no-op.
    fn release(&self, run_id: &str, owner_id: &str) -> Result<bool, KernelError>;
    fn get(&self, run_id: &str) -> Result<Option<LeaseRecord>, KernelError>;
    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, KernelError>;
}

#[derive(Clone)]
pub struct SqliteLeaseManager {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
}

impl SqliteLeaseManager {
    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

/// Validates `ttl` and returns the expiry it gives a lease taken at `now`.
fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, KernelError> {
    if ttl <= Duration::zero() {
        return Err(KernelError::Validation(format!(
            "lease ttl must be positive, got {}ms",
            ttl.num_milliseconds()
        )));
    }
    now.checked_add_signed(ttl).ok_or_else(|| {
        KernelError::Validation(format!(
            "lease ttl of {}s overflows the expiry time",
            ttl.num_seconds()
        ))
    })
}

impl LeaseManager for SqliteLeaseManager {
    fn acquire(&self, run_id: &str, owner_id: &str, ttl: Duration) -> Result<bool, KernelError> {
        let now = self.clock.now();
        let expires_at = expiry(now, ttl)?;
        let conn = self.store.lock()?;
        let written = conn
            .execute(
                "INSERT INTO run_leases(run_id, owner_id, acquired_at_ms, renewed_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?3, ?4)
                 ON CONFLICT(run_id) DO UPDATE SET
                   owner_id = excluded.owner_id,
                   acquired_at_ms = excluded.acquired_at_ms,
                   renewed_at_ms = excluded.renewed_at_ms,
                   expires_at_ms = excluded.expires_at_ms
                 WHERE run_leases.expires_at_ms <= ?3",
                params![run_id, owner_id, dt_to_ms(now), dt_to_ms(expires_at)],
            )
            .map_err(|e| KernelError::Storage(format!("acquire lease: {}", e)))?;
        let acquired = written == 1;
        debug!(run_id, owner_id, acquired, "lease acquire");
        Ok(acquired)
    }

    fn renew(&self, run_id: &str, owner_id: &str, ttl: Duration) -> Result<bool, KernelError> {
        let now = self.clock.now();
        let expires_at = expiry(now, ttl)?;
        let conn = self.store.lock()?;
        let updated = conn
            .execute(
                "UPDATE run_leases
                 SET renewed_at_ms = ?3, expires_at_ms = ?4
                 WHERE run_id = ?1 AND owner_id = ?2 AND expires_at_ms > ?3",
                params![run_id, owner_id, dt_to_ms(now), dt_to_ms(expires_at)],
            )
            .map_err(|e| KernelError::Storage(format!("renew lease: {}", e)))?;
        Ok(updated == 1)
    }

    fn release(&self, run_id: &str, owner_id: &str) -> Result<bool, KernelError> {
        let conn = self.store.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM run_leases WHERE run_id = ?1 AND owner_id = ?2",
                params![run_id, owner_id],
            )
            .map_err(|e| KernelError::Storage(format!("release lease: {}", e)))?;
        debug!(run_id, owner_id, released = deleted == 1, "lease release");
        Ok(deleted == 1)
    }

    fn get(&self, run_id: &str) -> Result<Option<LeaseRecord>, KernelError> {
        let conn = self.store.lock()?;
        load_lease(&conn, run_id)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, KernelError> {
        let conn = self.store.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM run_leases WHERE expires_at_ms <= ?1",
                params![dt_to_ms(now)],
            )
            .map_err(|e| KernelError::Storage(format!("sweep expired leases: {}", e)))?;
        Ok(deleted as u64)
    }
}

pub(crate) fn load_lease(conn: &Connection, run_id: &str) -> Result<Option<LeaseRecord>, KernelError> {
    conn.query_row(
        "SELECT run_id, owner_id, acquired_at_ms, renewed_at_ms, expires_at_ms
         FROM run_leases WHERE run_id = ?1",
        params![run_id],
        |row| {
            Ok(LeaseRecord {
                run_id: row.get(0)?,
                owner_id: row.get(1)?,
                acquired_at: ms_to_dt(row.get(2)?),
                renewed_at: ms_to_dt(row.get(3)?),
                expires_at: ms_to_dt(row.get(4)?),
            })
        },
    )
    .optional()
    .map_err(|e| KernelError::Storage(format!("read lease: {}", e)))
}

/// Fencing check used inside commit transactions.
pub(crate) fn holds_live_lease(
    conn: &Connection,
    run_id: &str,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, KernelError> {
    Ok(load_lease(conn, run_id)?
        .map(|lease| lease.is_held_by(owner_id, now))
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use conductor_kernel::ManualClock;

    use super::*;

    fn manager() -> (SqliteLeaseManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = SqliteStore::open_in_memory().expect("open store");
        (SqliteLeaseManager::new(store, clock.clone()), clock)
    }

    #[test]
    fn second_owner_is_denied_while_lease_is_live() {
        let (leases, _clock) = manager();
        let ttl = Duration::seconds(30);
        assert!(leases.acquire("run-1", "a", ttl).unwrap());
        assert!(!leases.acquire("run-1", "b", ttl).unwrap());
        // The holder itself cannot re-acquire either; it renews instead.
        assert!(!leases.acquire("run-1", "a", ttl).unwrap());
        assert_eq!(leases.get("run-1").unwrap().unwrap().owner_id, "a");
    }

    #[test]
    fn ttl_that_overflows_the_expiry_is_rejected() {
        let (leases, _clock) = manager();
        assert!(matches!(
            leases.acquire("run-1", "a", Duration::MAX),
            Err(KernelError::Validation(_))
        ));
        assert!(leases.get("run-1").unwrap().is_none());

        assert!(leases.acquire("run-1", "a", Duration::seconds(30)).unwrap());
        assert!(matches!(
            leases.renew("run-1", "a", Duration::MAX),
            Err(KernelError::Validation(_))
        ));
        assert!(matches!(
            leases.acquire("run-1", "a", Duration::zero()),
            Err(KernelError::Validation(_))
        ));
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let (leases, clock) = manager();
        assert!(leases.acquire("run-1", "a", Duration::seconds(5)).unwrap());
        clock.advance(Duration::seconds(5));
        assert!(leases.acquire("run-1", "b", Duration::seconds(5)).unwrap());
        let lease = leases.get("run-1").unwrap().unwrap();
        assert_eq!(lease.owner_id, "b");
        assert!(!leases.renew("run-1", "a", Duration::seconds(5)).unwrap());
    }

    #[test]
    fn release_by_non_owner_is_a_noop() {
        let (leases, _clock) = manager();
        let ttl = Duration::seconds(30);
        assert!(leases.acquire("run-1", "a", ttl).unwrap());
        assert!(!leases.release("run-1", "b").unwrap());
        assert!(!leases.acquire("run-1", "b", ttl).unwrap());
        assert!(leases.release("run-1", "a").unwrap());
        assert!(leases.acquire("run-1", "b", ttl).unwrap());
    }

    #[test]
    fn renew_extends_expiry_for_owner_only() {
        let (leases, clock) = manager();
        assert!(leases.acquire("run-1", "a", Duration::seconds(10)).unwrap());
        clock.advance(Duration::seconds(8));
        assert!(leases.renew("run-1", "a", Duration::seconds(10)).unwrap());
        assert!(!leases.renew("run-1", "b", Duration::seconds(10)).unwrap());
        clock.advance(Duration::seconds(8));
        assert!(!leases.acquire("run-1", "b", Duration::seconds(10)).unwrap());
        let lease = leases.get("run-1").unwrap().unwrap();
        assert_eq!(lease.expires_at, lease.renewed_at + Duration::seconds(10));
    }

    #[test]
    fn sweep_removes_only_expired_rows() {
        let (leases, clock) = manager();
        assert!(leases.acquire("short", "a", Duration::seconds(1)).unwrap());
        assert!(leases.acquire("long", "a", Duration::seconds(60)).unwrap());
        clock.advance(Duration::seconds(2));
        assert_eq!(leases.sweep_expired(clock.now()).unwrap(), 1);
        assert!(leases.get("short").unwrap().is_none());
        assert!(leases.get("long").unwrap().is_some());
    }

    #[test]
    fn non_positive_ttl_is_rejected() {
        let (leases, _clock) = manager();
        assert!(matches!(
            leases.acquire("run-1", "a", Duration::zero()),
            Err(KernelError::Validation(_))
        ));
    }
}
