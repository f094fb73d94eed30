//! Lease record: time-bounded mutual exclusion over one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{OwnerId, RunId};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseRecord {
    pub run_id: RunId,
    pub owner_id: OwnerId,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// A lease whose `expires_at` is not in the past relative to `now` is live.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn is_held_by(&self, owner_id: &str, now: DateTime<Utc>) -> bool {
        self.owner_id == owner_id && self.is_live(now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn lease_expires_at_its_deadline() {
        let now = Utc::now();
        let lease = LeaseRecord {
            run_id: "run-1".into(),
            owner_id: "worker-a".into(),
            acquired_at: now,
            renewed_at: now,
            expires_at: now + Duration::seconds(30),
        };
        assert!(lease.is_held_by("worker-a", now));
        assert!(!lease.is_held_by("worker-b", now));
        assert!(!lease.is_live(now + Duration::seconds(30)));
    }
}
