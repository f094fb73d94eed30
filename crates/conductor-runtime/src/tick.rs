//! `tick_once`: select, lease, step, release, audit.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use conductor_kernel::{AuditRecord, KernelError, RunId};

use crate::audit::{actor_or_system, AuditLog};
use crate::counters::{CounterScope, DailyCounters, TICKS_KEY};
use crate::executor::{GraphExecutor, StepOutcome};
use crate::lease::LeaseManager;
use crate::scheduler::{IdleReason, Scheduler, SchedulerDecision, TickBudget, TickCaps};

pub const TICK_ACTION: &str = "tick";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    Idle,
    Success,
    Error,
}

impl TickStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Outcome of one `tick_once` invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TickResult {
    pub status: TickStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Distinct runs that committed at least one step.
    pub ticked_runs: usize,
    /// Committed steps across all runs.
    pub ticks: u32,
    pub events_added: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Runs leased during the invocation, in dispatch order.
    pub run_ids: Vec<RunId>,
}

#[derive(Default)]
struct TickProgress {
    run_ids: Vec<RunId>,
    ticked_runs: usize,
    ticks: u32,
    events_added: usize,
}

#[derive(Clone)]
pub struct TickCoordinator {
    scheduler: Scheduler,
    leases: Arc<dyn LeaseManager>,
    executor: GraphExecutor,
    audit: AuditLog,
    counters: DailyCounters,
    lease_ttl: Duration,
}

impl TickCoordinator {
    pub fn new(
        scheduler: Scheduler,
        leases: Arc<dyn LeaseManager>,
        executor: GraphExecutor,
        audit: AuditLog,
        counters: DailyCounters,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            scheduler,
            leases,
            executor,
            audit,
            counters,
            lease_ttl,
        }
    }

    /// Advances the `(env, lane)` pair by at most `caps` worth of steps.
    ///
    /// Never returns an error: storage and validation failures are reported as
    /// `status: error`. Exactly one audit entry is written per call.
    pub fn tick_once(&self, env: &str, lane: &str, owner_id: &str, caps: &TickCaps) -> TickResult {
        let mut progress = TickProgress::default();
        let outcome = validate_request(env, lane, owner_id, caps)
            .and_then(|_| self.run_invocation(env, lane, owner_id, caps, &mut progress));

        let (status, reason, error) = match outcome {
            Ok(_) if progress.ticks > 0 => (TickStatus::Success, None, None),
            Ok(idle) => (TickStatus::Idle, Some(idle.as_str().to_string()), None),
            Err(err) => (TickStatus::Error, Some(error_reason(&err).to_string()), Some(err)),
        };
        let result = TickResult {
            status,
            reason,
            ticked_runs: progress.ticked_runs,
            ticks: progress.ticks,
            events_added: progress.events_added,
            message: error.as_ref().map(|e| e.to_string()),
            run_ids: progress.run_ids,
        };

        let mut record = AuditRecord::new(TICK_ACTION, status.as_str(), actor_or_system(owner_id))
            .target(format!("{}/{}", env, lane))
            .payload(json!({
                "env": env,
                "lane": lane,
                "owner_id": owner_id,
                "run_ids": result.run_ids,
                "ticked_runs": result.ticked_runs,
                "ticks": result.ticks,
                "events_added": result.events_added,
                "reason": result.reason,
            }));
        if let Some(err) = &error {
            record = record.error(json!({"code": err.code(), "message": err.to_string()}));
        }
        self.audit.record(record);

        match &error {
            Some(err) => warn!(env, lane, owner_id, error = %err, "tick failed"),
            None => info!(
                env,
                lane,
                owner_id,
                status = status.as_str(),
                reason = result.reason.as_deref().unwrap_or(""),
                ticks = result.ticks,
                events_added = result.events_added,
                "tick finished"
            ),
        }
        result
    }

    /// Runs the selection loop and returns the idle reason that ended it.
    fn run_invocation(
        &self,
        env: &str,
        lane: &str,
        owner_id: &str,
        caps: &TickCaps,
        progress: &mut TickProgress,
    ) -> Result<IdleReason, KernelError> {
        let mut budget = TickBudget::new(caps.clone());
        loop {
            let run_id = match self.scheduler.next_runnable(env, lane, &budget)? {
                SchedulerDecision::Idle(reason) => return Ok(reason),
                SchedulerDecision::Dispatch(run_id) => run_id,
            };
            if !self.leases.acquire(&run_id, owner_id, self.lease_ttl)? {
                debug!(run_id = %run_id, owner_id, "lease held elsewhere");
                budget.finish(&run_id);
                if caps.retry_on_lease_conflict {
                    continue;
                }
                return Ok(IdleReason::LeaseConflict);
            }
            progress.run_ids.push(run_id.clone());

            let driven = self.drive_run(lane, &run_id, owner_id, &mut budget, progress);
            budget.finish(&run_id);
            if let Err(err) = self.leases.release(&run_id, owner_id) {
                warn!(run_id = %run_id, owner_id, error = %err, "lease release failed");
            }
            driven?;
        }
    }

    /// Executes steps of one leased run while the budget allows and the run
    /// keeps advancing.
    fn drive_run(
        &self,
        lane: &str,
        run_id: &str,
        owner_id: &str,
        budget: &mut TickBudget,
        progress: &mut TickProgress,
    ) -> Result<(), KernelError> {
        let mut steps = 0u32;
        while budget.allows(run_id) {
            if steps > 0 && !self.leases.renew(run_id, owner_id, self.lease_ttl)? {
                warn!(run_id, owner_id, "lease lost between steps");
                break;
            }
            let report = match self.executor.step_fenced(run_id, owner_id) {
                Ok(report) => report,
                Err(err) if err.is_lease_conflict() => {
                    warn!(run_id, owner_id, "commit fenced off; lease no longer held");
                    break;
                }
                Err(err) => return Err(err),
            };
            if let StepOutcome::AlreadyTerminal(status) = report.outcome {
                debug!(run_id, %status, "run already terminal");
                break;
            }

            if steps == 0 {
                progress.ticked_runs += 1;
            }
            steps += 1;
            budget.record_tick(run_id);
            progress.ticks += 1;
            progress.events_added += report.events_added();
            self.count_tick(lane, run_id);

            if report.outcome != StepOutcome::Advanced {
                break;
            }
        }
        Ok(())
    }

    fn count_tick(&self, lane: &str, run_id: &str) {
        let day = self.counters.today();
        for (scope, scope_id) in [(CounterScope::Lane, lane), (CounterScope::Run, run_id)] {
            if let Err(err) = self.counters.increment(day, scope, scope_id, TICKS_KEY, 1) {
                warn!(scope = scope.as_str(), scope_id, error = %err, "tick counter update failed");
            }
        }
    }
}

fn validate_request(env: &str, lane: &str, owner_id: &str, caps: &TickCaps) -> Result<(), KernelError> {
    for (name, value) in [("env", env), ("lane", lane), ("owner_id", owner_id)] {
        if value.trim().is_empty() {
            return Err(KernelError::Validation(format!("{} must not be empty", name)));
        }
    }
    caps.validate()
}

fn error_reason(err: &KernelError) -> &'static str {
    match err {
        KernelError::Validation(_) => "invalid_request",
        KernelError::NotFound(_) => "not_found",
        KernelError::LeaseConflict { .. } => "lease_conflict",
        KernelError::Storage(_) => "storage_error",
    }
}
