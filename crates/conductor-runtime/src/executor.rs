//! Single-step graph executor.
//!
//! One call executes at most one step. The handler runs outside any
//! transaction; its result is then committed together with the run status,
//! the run state and every resulting event in one transaction. Subscribers are
//! notified after commit.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

use conductor_kernel::{
    event_types, ArtifactWriter, Clock, EventRecord, KernelError, RunError, RunState, RunStatus,
    RunSummary, StepContext, StepError, StepHandlerRegistry, StepId, StepOutput, StepSpec,
    StepState, StepStatus,
};

use crate::event_log::{insert_event, EventLog};
use crate::lease::holds_live_lease;
use crate::run_store::{load_run, load_state, save_state, update_run_progress};
use crate::store::SqliteStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// A step completed and more remain.
    Advanced,
    /// The last step completed; the run is `succeeded`.
    Succeeded,
    /// A step failed; the run is `failed`.
    Failed,
    /// Nothing was executed because the run had already finished.
    AlreadyTerminal(RunStatus),
}

/// What one executor call did.
#[derive(Clone, Debug)]
pub struct StepReport {
    pub run_id: String,
    pub step_id: Option<StepId>,
    pub outcome: StepOutcome,
    pub events: Vec<EventRecord>,
    pub last_error: Option<RunError>,
}

impl StepReport {
    pub fn events_added(&self) -> usize {
        self.events.len()
    }
}

#[derive(Clone)]
pub struct GraphExecutor {
    store: SqliteStore,
    events: EventLog,
    registry: Arc<StepHandlerRegistry>,
    artifacts: Arc<dyn ArtifactWriter>,
    clock: Arc<dyn Clock>,
}

struct PlannedStep {
    step_id: StepId,
    spec: StepSpec,
}

struct PendingEvent {
    event_type: &'static str,
    payload: Value,
    at: DateTime<Utc>,
}

impl GraphExecutor {
    pub fn new(
        store: SqliteStore,
        events: EventLog,
        registry: Arc<StepHandlerRegistry>,
        artifacts: Arc<dyn ArtifactWriter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            events,
            registry,
            artifacts,
            clock,
        }
    }

    /// Executes the next eligible step of `run_id`.
    pub fn step(&self, run_id: &str) -> Result<StepReport, KernelError> {
        self.execute(run_id, None)
    }

    /// Like [GraphExecutor::step], but refuses to commit unless `owner_id`
    /// still holds a live lease on the run at commit time.
    pub fn step_fenced(&self, run_id: &str, owner_id: &str) -> Result<StepReport, KernelError> {
        self.execute(run_id, Some(owner_id))
    }

    fn execute(&self, run_id: &str, owner_id: Option<&str>) -> Result<StepReport, KernelError> {
        let (run, state) = {
            let conn = self.store.lock()?;
            let run = load_run(&conn, run_id)?
                .ok_or_else(|| KernelError::NotFound(format!("run {}", run_id)))?;
            if let Some(owner_id) = owner_id {
                if !holds_live_lease(&conn, run_id, owner_id, self.clock.now())? {
                    return Err(KernelError::LeaseConflict {
                        run_id: run_id.to_string(),
                    });
                }
            }
            let state = load_state(&conn, run_id)?
                .map(|record| record.state)
                .unwrap_or_default();
            (run, state)
        };
        if run.status.is_terminal() {
            return Ok(terminal_report(run_id, run.status));
        }

        let planned = run
            .run_graph
            .next_eligible(&state)
            .map(|(step_id, spec)| PlannedStep {
                step_id: step_id.clone(),
                spec: spec.clone(),
            });
        let started_at = self.clock.now();
        let result = planned
            .as_ref()
            .map(|step| self.run_handler(&run, &state, step));
        let finished_at = self.clock.now();

        let committed = self.store.with_transaction(|tx| {
            if let Some(owner_id) = owner_id {
                if !holds_live_lease(tx, run_id, owner_id, self.clock.now())? {
                    return Err(KernelError::LeaseConflict {
                        run_id: run_id.to_string(),
                    });
                }
            }
            let current = load_run(tx, run_id)?
                .ok_or_else(|| KernelError::NotFound(format!("run {}", run_id)))?;
            if current.status.is_terminal() {
                return Ok(terminal_report(run_id, current.status));
            }
            let current_ticks = load_state(tx, run_id)?
                .map(|record| record.state.tick_count)
                .unwrap_or(0);
            if current_ticks != state.tick_count {
                // Someone else advanced the run while the handler was running.
                return Err(KernelError::LeaseConflict {
                    run_id: run_id.to_string(),
                });
            }

            let mut run = current;
            let mut state = state.clone();
            let (outcome, pending) = apply_step(
                &mut run,
                &mut state,
                planned.as_ref(),
                result,
                started_at,
                finished_at,
            );
            update_run_progress(tx, &run)?;
            save_state(tx, run_id, &state, finished_at)?;
            let mut events = Vec::with_capacity(pending.len());
            for event in pending {
                events.push(insert_event(
                    tx,
                    run_id,
                    event.event_type,
                    &event.payload,
                    event.at,
                )?);
            }
            Ok(StepReport {
                run_id: run_id.to_string(),
                step_id: planned.as_ref().map(|step| step.step_id.clone()),
                outcome,
                events,
                last_error: run.last_error,
            })
        })?;

        self.events.publish(&committed.events);
        match &committed.outcome {
            StepOutcome::AlreadyTerminal(status) => {
                debug!(run_id, %status, "run finished before commit; step discarded");
            }
            outcome => {
                info!(
                    run_id,
                    step_id = committed.step_id.as_deref().unwrap_or(""),
                    outcome = ?outcome,
                    events = committed.events.len(),
                    "step committed"
                );
            }
        }
        Ok(committed)
    }

    fn run_handler(
        &self,
        run: &RunSummary,
        state: &RunState,
        step: &PlannedStep,
    ) -> Result<StepOutput, StepError> {
        let Some(handler) = self.registry.resolve(&run.job_type, &step.spec.step_type) else {
            return Err(StepError::Unsupported {
                job_type: run.job_type.clone(),
                step_type: step.spec.step_type.clone(),
            });
        };
        let ctx = StepContext {
            run_id: &run.run_id,
            step_id: &step.step_id,
            step_type: &step.spec.step_type,
            job_type: &run.job_type,
            env: &run.env,
            lane: &run.lane,
            mode: &run.mode,
            config: &step.spec.config,
            params: &run.params,
            state,
            artifacts: self.artifacts.as_ref(),
        };
        match panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&ctx))) {
            Ok(result) => result,
            Err(payload) => Err(StepError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

fn terminal_report(run_id: &str, status: RunStatus) -> StepReport {
    StepReport {
        run_id: run_id.to_string(),
        step_id: None,
        outcome: StepOutcome::AlreadyTerminal(status),
        events: Vec::new(),
        last_error: None,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Applies one step result to the in-memory run and state and lists the
/// events to write, in order.
fn apply_step(
    run: &mut RunSummary,
    state: &mut RunState,
    planned: Option<&PlannedStep>,
    result: Option<Result<StepOutput, StepError>>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> (StepOutcome, Vec<PendingEvent>) {
    let mut events = Vec::new();
    state.tick_count += 1;

    if run.status == RunStatus::Pending {
        run.status = RunStatus::Running;
        run.started_at = Some(started_at);
        events.push(PendingEvent {
            event_type: event_types::RUN_STARTED,
            payload: json!({"first_step": planned.map(|s| s.step_id.as_str())}),
            at: started_at,
        });
    }

    let (step, result) = match (planned, result) {
        (Some(step), Some(result)) => (step, result),
        _ => {
            // No eligible step: either everything completed or the graph is stuck.
            if run.run_graph.is_complete(state) {
                return (StepOutcome::Succeeded, succeed(run, state, finished_at, events));
            }
            let error = RunError {
                stage: "graph".to_string(),
                step_id: None,
                step_type: None,
                kind: "no_eligible_step".to_string(),
                message: "no remaining step has all dependencies completed".to_string(),
            };
            return fail(run, error, finished_at, events);
        }
    };

    events.push(PendingEvent {
        event_type: event_types::STEP_STARTED,
        payload: json!({"step_id": step.step_id, "step_type": step.spec.step_type}),
        at: started_at,
    });
    let duration_ms = (finished_at - started_at).num_milliseconds().max(0);

    match result {
        Ok(output) => {
            events.push(PendingEvent {
                event_type: event_types::STEP_COMPLETED,
                payload: json!({
                    "step_id": step.step_id,
                    "step_type": step.spec.step_type,
                    "duration_ms": duration_ms,
                    "artifact_uris": output.artifact_uris,
                }),
                at: finished_at,
            });
            state.steps.insert(
                step.step_id.clone(),
                StepState {
                    status: StepStatus::Completed,
                    started_at,
                    finished_at,
                    output: output.output,
                    artifact_uris: output.artifact_uris,
                    error: None,
                },
            );
            if run.run_graph.is_complete(state) {
                return (StepOutcome::Succeeded, succeed(run, state, finished_at, events));
            }
            (StepOutcome::Advanced, events)
        }
        Err(err) => {
            let error = RunError {
                stage: "step".to_string(),
                step_id: Some(step.step_id.clone()),
                step_type: Some(step.spec.step_type.clone()),
                kind: err.kind().to_string(),
                message: err.to_string(),
            };
            events.push(PendingEvent {
                event_type: event_types::STEP_FAILED,
                payload: json!({
                    "step_id": step.step_id,
                    "step_type": step.spec.step_type,
                    "duration_ms": duration_ms,
                    "error": {"kind": error.kind, "message": error.message},
                }),
                at: finished_at,
            });
            let mut step_state = StepState::finished(StepStatus::Failed, started_at, finished_at);
            step_state.error = Some(error.message.clone());
            state.steps.insert(step.step_id.clone(), step_state);
            fail(run, error, finished_at, events)
        }
    }
}

fn succeed(
    run: &mut RunSummary,
    state: &RunState,
    at: DateTime<Utc>,
    mut events: Vec<PendingEvent>,
) -> Vec<PendingEvent> {
    run.status = RunStatus::Succeeded;
    run.finished_at = Some(at);
    events.push(PendingEvent {
        event_type: event_types::RUN_SUCCEEDED,
        payload: json!({"steps_completed": state.completed_count()}),
        at,
    });
    events
}

fn fail(
    run: &mut RunSummary,
    error: RunError,
    at: DateTime<Utc>,
    mut events: Vec<PendingEvent>,
) -> (StepOutcome, Vec<PendingEvent>) {
    run.status = RunStatus::Failed;
    run.finished_at = Some(at);
    let reason = if error.stage == "step" {
        "step_failed"
    } else {
        error.kind.as_str()
    };
    events.push(PendingEvent {
        event_type: event_types::RUN_FAILED,
        payload: json!({
            "reason": reason,
            "step_id": error.step_id,
            "error": {"kind": error.kind, "message": error.message},
        }),
        at,
    });
    run.last_error = Some(error);
    (StepOutcome::Failed, events)
}
