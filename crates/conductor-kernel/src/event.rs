//! Run events: the append-only trail of every state change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{RunId, Seq};

/// Event type tags written by the engine.
pub mod event_types {
    pub const RUN_CREATED: &str = "run_created";
    pub const RUN_STARTED: &str = "run_started";
    pub const STEP_STARTED: &str = "step_started";
    pub const STEP_COMPLETED: &str = "step_completed";
    pub const STEP_FAILED: &str = "step_failed";
    pub const RUN_SUCCEEDED: &str = "run_succeeded";
    pub const RUN_FAILED: &str = "run_failed";
}

/// One committed event. Ordering key is `(timestamp, sequence_id)`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub sequence_id: Seq,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
}

impl EventRecord {
    pub fn ordering_key(&self) -> (i64, Seq) {
        (self.timestamp.timestamp_millis(), self.sequence_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type == event_types::RUN_SUCCEEDED || self.event_type == event_types::RUN_FAILED
    }

    /// `step_id` field of the payload, when the event concerns a step.
    pub fn step_id(&self) -> Option<&str> {
        self.payload.get("step_id").and_then(Value::as_str)
    }
}
