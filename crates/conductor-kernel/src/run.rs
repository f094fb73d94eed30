//! Run identity, run graph and run summary.
//!
//! A run graph is a flat map of steps with declared dependencies; it is not a
//! scripting language. Graphs are validated when a run is created so that the
//! executor never has to deal with dangling dependencies or cycles.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KernelError;
use crate::identity::{RunId, StepId};
use crate::state::RunState;

/// Persisted schema version stamped on every run row.
pub const RUN_SCHEMA_VERSION: &str = "v2";

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a run graph.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct StepSpec {
    /// Handler type tag, resolved through the step handler registry.
    #[serde(rename = "type", alias = "kind")]
    pub step_type: String,
    #[serde(default)]
    pub deps: Vec<StepId>,
    /// Handler-specific configuration.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl StepSpec {
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            deps: Vec::new(),
            config: Value::Null,
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Flat step-dependency map.
///
/// ```json
/// {"steps": {"noop": {"type": "noop", "deps": []}}, "initial_step": "noop"}
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct RunGraph {
    pub steps: BTreeMap<StepId, StepSpec>,
    #[serde(default, alias = "entry_step", skip_serializing_if = "Option::is_none")]
    pub initial_step: Option<StepId>,
}

impl RunGraph {
    /// Graph with a single step that is also the initial step.
    pub fn single(step_id: impl Into<StepId>, step_type: impl Into<String>) -> Self {
        let step_id = step_id.into();
        let mut steps = BTreeMap::new();
        steps.insert(step_id.clone(), StepSpec::new(step_type));
        Self {
            steps,
            initial_step: Some(step_id),
        }
    }

    pub fn with_step(mut self, step_id: impl Into<StepId>, spec: StepSpec) -> Self {
        self.steps.insert(step_id.into(), spec);
        self
    }

    /// JSON schema of the graph document, for API layers that validate input.
    pub fn json_schema() -> Value {
        serde_json::to_value(schemars::schema_for!(RunGraph)).unwrap_or_default()
    }

    /// Rejects empty graphs, blank step types, dangling or self dependencies,
    /// an unknown initial step, and dependency cycles.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.steps.is_empty() {
            return Err(KernelError::Validation(
                "run_graph must declare at least one step".to_string(),
            ));
        }
        if let Some(initial) = &self.initial_step {
            if !self.steps.contains_key(initial) {
                return Err(KernelError::Validation(format!(
                    "initial_step '{}' is not a declared step",
                    initial
                )));
            }
        }
        for (step_id, spec) in &self.steps {
            if step_id.trim().is_empty() {
                return Err(KernelError::Validation("step id must not be blank".to_string()));
            }
            if spec.step_type.trim().is_empty() {
                return Err(KernelError::Validation(format!(
                    "step '{}' has a blank type",
                    step_id
                )));
            }
            for dep in &spec.deps {
                if dep == step_id {
                    return Err(KernelError::Validation(format!(
                        "step '{}' depends on itself",
                        step_id
                    )));
                }
                if !self.steps.contains_key(dep) {
                    return Err(KernelError::Validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step_id, dep
                    )));
                }
            }
        }
        if let Some(step_id) = self.find_cycle() {
            return Err(KernelError::Validation(format!(
                "dependency cycle through step '{}'",
                step_id
            )));
        }
        Ok(())
    }

    /// Candidate order: the initial step first, then step ids lexicographically.
    pub fn candidate_order(&self) -> Vec<&StepId> {
        let mut ordered: Vec<&StepId> = Vec::with_capacity(self.steps.len());
        if let Some(initial) = self.initial_step.as_ref() {
            if self.steps.contains_key(initial) {
                ordered.push(initial);
            }
        }
        for step_id in self.steps.keys() {
            if Some(step_id) != self.initial_step.as_ref() {
                ordered.push(step_id);
            }
        }
        ordered
    }

    /// The single next step that has not run and whose deps are all completed.
    pub fn next_eligible<'a>(&'a self, state: &RunState) -> Option<(&'a StepId, &'a StepSpec)> {
        self.candidate_order().into_iter().find_map(|step_id| {
            if state.has_run(step_id) {
                return None;
            }
            let spec = self.steps.get(step_id)?;
            spec.deps
                .iter()
                .all(|dep| state.is_completed(dep))
                .then_some((step_id, spec))
        })
    }

    /// True once every declared step has completed.
    pub fn is_complete(&self, state: &RunState) -> bool {
        self.steps.keys().all(|step_id| state.is_completed(step_id))
    }

    pub fn step_types(&self) -> BTreeSet<&str> {
        self.steps.values().map(|s| s.step_type.as_str()).collect()
    }

    fn find_cycle(&self) -> Option<&StepId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a RunGraph,
            step_id: &'a StepId,
            marks: &mut BTreeMap<&'a StepId, Mark>,
        ) -> Option<&'a StepId> {
            match marks.get(step_id) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => return Some(step_id),
                None => {}
            }
            marks.insert(step_id, Mark::Visiting);
            if let Some(spec) = graph.steps.get(step_id) {
                for dep in &spec.deps {
                    if let Some(found) = visit(graph, dep, marks) {
                        return Some(found);
                    }
                }
            }
            marks.insert(step_id, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        self.steps
            .keys()
            .find_map(|step_id| visit(self, step_id, &mut marks))
    }
}

/// Structured `last_error` of a failed run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunError {
    /// Where the failure happened: `step` or `cancelled`.
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    pub kind: String,
    pub message: String,
}

/// Input of `create_run`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NewRun {
    pub env: String,
    pub lane: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub job_type: String,
    #[serde(default = "default_requested_by")]
    pub requested_by: String,
    pub run_graph: RunGraph,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
}

fn default_mode() -> String {
    "dry_run".to_string()
}

fn default_requested_by() -> String {
    "system".to_string()
}

impl NewRun {
    pub fn new(
        env: impl Into<String>,
        lane: impl Into<String>,
        job_type: impl Into<String>,
        run_graph: RunGraph,
    ) -> Self {
        Self {
            env: env.into(),
            lane: lane.into(),
            mode: default_mode(),
            job_type: job_type.into(),
            requested_by: default_requested_by(),
            run_graph,
            params: Value::Object(Default::default()),
            parent_run_id: None,
        }
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn requested_by(mut self, requested_by: impl Into<String>) -> Self {
        self.requested_by = requested_by.into();
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn parent(mut self, parent_run_id: impl Into<RunId>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }

    /// Field presence checks plus graph validation.
    pub fn validate(&self) -> Result<(), KernelError> {
        for (name, value) in [
            ("env", &self.env),
            ("lane", &self.lane),
            ("mode", &self.mode),
            ("job_type", &self.job_type),
            ("requested_by", &self.requested_by),
        ] {
            if value.trim().is_empty() {
                return Err(KernelError::Validation(format!("{} must not be blank", name)));
            }
        }
        if let Some(parent) = &self.parent_run_id {
            if parent.trim().is_empty() {
                return Err(KernelError::Validation(
                    "parent_run_id must not be blank when present".to_string(),
                ));
            }
        }
        self.run_graph.validate()
    }
}

/// Persisted run row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub schema_version: String,
    pub status: RunStatus,
    pub env: String,
    pub lane: String,
    pub mode: String,
    pub job_type: String,
    pub requested_by: String,
    pub parent_run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<RunError>,
    pub run_graph: RunGraph,
    pub params: Value,
}

/// Filters for `list_runs`. `requested_by` is a substring match.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RunFilter {
    pub env: Option<String>,
    pub lane: Option<String>,
    pub status: Option<RunStatus>,
    pub job_type: Option<String>,
    pub requested_by: Option<String>,
}
