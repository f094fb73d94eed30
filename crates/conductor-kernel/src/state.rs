//! Per-run execution checkpoint.
//!
//! One [RunState] exists per run. It is rewritten by the executor in the same
//! transaction as the run status change, so it always agrees with the event log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{RunId, StepId};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Outcome of one executed step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepState {
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepState {
    pub fn finished(
        status: StepStatus,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            started_at,
            finished_at,
            output: Value::Null,
            artifact_uris: Vec::new(),
            error: None,
        }
    }
}

/// Serialized execution state of a run.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    #[serde(default)]
    pub steps: BTreeMap<StepId, StepState>,
    /// Number of executor steps applied to this run.
    #[serde(default)]
    pub tick_count: u64,
}

impl RunState {
    /// True once the step has executed, whatever its outcome.
    pub fn has_run(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.steps
            .get(step_id)
            .map(|s| s.status == StepStatus::Completed)
            .unwrap_or(false)
    }

    pub fn completed_count(&self) -> usize {
        self.steps
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    pub fn artifact_uris(&self) -> impl Iterator<Item = &str> {
        self.steps
            .values()
            .flat_map(|s| s.artifact_uris.iter().map(String::as_str))
    }
}

/// Persisted `run_states` row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunStateRecord {
    pub run_id: RunId,
    pub state: RunState,
    pub updated_at: DateTime<Utc>,
}
