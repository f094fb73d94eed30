//! Step handler capability: the single method run graphs dispatch to.

use serde_json::Value;
use thiserror::Error;

use crate::artifact::{ArtifactError, ArtifactWriter};
use crate::identity::{RunId, StepId};
use crate::state::RunState;

/// Everything a handler may look at while executing one step.
pub struct StepContext<'a> {
    pub run_id: &'a RunId,
    pub step_id: &'a StepId,
    pub step_type: &'a str,
    pub job_type: &'a str,
    pub env: &'a str,
    pub lane: &'a str,
    pub mode: &'a str,
    /// The step's own `config` from the run graph.
    pub config: &'a Value,
    /// Run-level `params`.
    pub params: &'a Value,
    /// Checkpoint before this step (outputs of completed deps).
    pub state: &'a RunState,
    pub artifacts: &'a dyn ArtifactWriter,
}

impl StepContext<'_> {
    /// Output recorded by an earlier step, if it completed.
    pub fn dep_output(&self, step_id: &str) -> Option<&Value> {
        self.state.steps.get(step_id).map(|s| &s.output)
    }
}

/// Successful step result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepOutput {
    pub output: Value,
    pub artifact_uris: Vec<String>,
}

impl StepOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_output(output: Value) -> Self {
        Self {
            output,
            artifact_uris: Vec::new(),
        }
    }
}

/// Step failure. Always becomes a run-level failure, never a failed tick.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StepError {
    #[error("{message}")]
    Failed { kind: String, message: String },
    #[error("artifact: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("unsupported step type '{step_type}' for job '{job_type}'")]
    Unsupported { job_type: String, step_type: String },
    #[error("step handler panicked: {0}")]
    Panicked(String),
}

impl StepError {
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Value of `last_error.kind`.
    pub fn kind(&self) -> &str {
        match self {
            Self::Failed { kind, .. } => kind,
            Self::Artifact(_) => "artifact_error",
            Self::Unsupported { .. } => "unsupported_step_type",
            Self::Panicked(_) => "panic",
        }
    }
}

/// Executes one step type. Implementations must be `Send + Sync` so one
/// registry can serve concurrent ticks.
pub trait StepHandler: Send + Sync {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError>;
}

impl<F> StepHandler for F
where
    F: Fn(&StepContext<'_>) -> Result<StepOutput, StepError> + Send + Sync,
{
    fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        self(ctx)
    }
}
