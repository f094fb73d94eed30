//! Step handler registry keyed by `(job_type, step_type)`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::artifact::WriteArtifactStepHandler;
use crate::error::KernelError;
use crate::run::RunGraph;
use crate::step::StepHandler;
use crate::stubs::{FailingStepHandler, NoopStepHandler};

/// Resolution order: exact `(job_type, step_type)` registration first, then
/// the any-job registration for `step_type`.
#[derive(Clone, Default)]
pub struct StepHandlerRegistry {
    by_job: HashMap<(String, String), Arc<dyn StepHandler>>,
    any_job: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `noop`, `fail` and `write_artifact` for every job type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("noop", NoopStepHandler);
        registry.register("fail", FailingStepHandler::default());
        registry.register("write_artifact", WriteArtifactStepHandler);
        registry
    }

    pub fn register<H>(&mut self, step_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: StepHandler + 'static,
    {
        self.any_job.insert(step_type.into(), Arc::new(handler));
        self
    }

    pub fn register_for_job<H>(
        &mut self,
        job_type: impl Into<String>,
        step_type: impl Into<String>,
        handler: H,
    ) -> &mut Self
    where
        H: StepHandler + 'static,
    {
        self.by_job
            .insert((job_type.into(), step_type.into()), Arc::new(handler));
        self
    }

    pub fn resolve(&self, job_type: &str, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.by_job
            .get(&(job_type.to_string(), step_type.to_string()))
            .or_else(|| self.any_job.get(step_type))
            .cloned()
    }

    pub fn supports(&self, job_type: &str, step_type: &str) -> bool {
        self.resolve(job_type, step_type).is_some()
    }

    /// Every step type of `graph` must resolve for `job_type`.
    pub fn check_graph(&self, job_type: &str, graph: &RunGraph) -> Result<(), KernelError> {
        for (step_id, spec) in &graph.steps {
            if !self.supports(job_type, &spec.step_type) {
                return Err(KernelError::Validation(format!(
                    "step '{}' has unsupported type '{}' for job '{}'",
                    step_id, spec.step_type, job_type
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StepHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut any_job: Vec<_> = self.any_job.keys().collect();
        any_job.sort();
        f.debug_struct("StepHandlerRegistry")
            .field("any_job", &any_job)
            .field("by_job", &self.by_job.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::artifact::InMemoryArtifactWriter;
    use crate::run::StepSpec;
    use crate::state::RunState;
    use crate::step::{StepContext, StepError, StepOutput};

    fn run_handler(handler: &dyn StepHandler) -> Result<StepOutput, StepError> {
        let writer = InMemoryArtifactWriter::new();
        let state = RunState::default();
        let (run_id, step_id) = ("run-1".to_string(), "s".to_string());
        let config = json!({});
        handler.execute(&StepContext {
            run_id: &run_id,
            step_id: &step_id,
            step_type: "any",
            job_type: "job",
            env: "local",
            lane: "default",
            mode: "dry_run",
            config: &config,
            params: &config,
            state: &state,
            artifacts: &writer,
        })
    }

    #[test]
    fn job_specific_registration_wins() {
        let mut registry = StepHandlerRegistry::with_builtins();
        registry.register_for_job("strict", "noop", FailingStepHandler::new("strict", "nope"));

        let generic = registry.resolve("other", "noop").unwrap();
        assert!(run_handler(generic.as_ref()).is_ok());

        let strict = registry.resolve("strict", "noop").unwrap();
        let err = run_handler(strict.as_ref()).unwrap_err();
        assert_eq!(err.kind(), "strict");
    }

    #[test]
    fn check_graph_rejects_unknown_types() {
        let registry = StepHandlerRegistry::with_builtins();
        let ok = RunGraph::single("a", "noop").with_step("b", StepSpec::new("write_artifact"));
        registry.check_graph("job", &ok).unwrap();

        let bad = RunGraph::single("a", "teleport");
        assert!(matches!(
            registry.check_graph("job", &bad),
            Err(KernelError::Validation(msg)) if msg.contains("teleport")
        ));
    }

    #[test]
    fn builtin_write_artifact_records_uri() {
        let registry = StepHandlerRegistry::with_builtins();
        let handler = registry.resolve("job", "write_artifact").unwrap();
        let out = run_handler(handler.as_ref()).unwrap();
        assert_eq!(out.artifact_uris, vec!["mem://run-1/s".to_string()]);
        assert_eq!(out.output["uri"], "mem://run-1/s");
    }
}
