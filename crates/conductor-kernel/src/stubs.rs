//! Built-in handlers for tests and smoke runs.

use serde_json::Value;

use crate::step::{StepContext, StepError, StepHandler, StepOutput};

/// Step handler that does nothing and succeeds.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStepHandler;

impl StepHandler for NoopStepHandler {
    fn execute(&self, _ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        Ok(StepOutput::empty())
    }
}

/// Step handler that always fails. The step config may override the message
/// with `{"message": "..."}`.
#[derive(Clone, Debug)]
pub struct FailingStepHandler {
    kind: String,
    message: String,
}

impl FailingStepHandler {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl Default for FailingStepHandler {
    fn default() -> Self {
        Self::new("simulated_failure", "step failed")
    }
}

impl StepHandler for FailingStepHandler {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let message = ctx
            .config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(self.message.as_str());
        Err(StepError::failed(self.kind.clone(), message))
    }
}
