//! FIFO-with-caps run selection.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use conductor_kernel::{KernelError, RunId};

use crate::config_registry::KillSwitch;
use crate::counters::{CounterScope, DailyCounters};
use crate::run_store::RunStore;

/// Per-invocation limits of `tick_once`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TickCaps {
    /// Steps one invocation may execute across all runs. Authoritative.
    pub max_total_ticks_per_invocation: u32,
    /// Steps one invocation may execute on the same run.
    pub max_ticks_per_run_per_invocation: u32,
    /// Optional ceiling on the lane's tick counter for the current UTC day.
    pub daily_tick_cap: Option<i64>,
    /// Skip a run whose lease is held elsewhere and try the next candidate
    /// instead of ending the invocation.
    pub retry_on_lease_conflict: bool,
}

impl Default for TickCaps {
    fn default() -> Self {
        Self {
            max_total_ticks_per_invocation: 20,
            max_ticks_per_run_per_invocation: 10,
            daily_tick_cap: None,
            retry_on_lease_conflict: false,
        }
    }
}

impl TickCaps {
    pub fn single() -> Self {
        Self {
            max_total_ticks_per_invocation: 1,
            max_ticks_per_run_per_invocation: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_total_ticks_per_invocation == 0 {
            return Err(KernelError::Validation(
                "max_total_ticks_per_invocation must be at least 1".to_string(),
            ));
        }
        if self.max_ticks_per_run_per_invocation == 0 {
            return Err(KernelError::Validation(
                "max_ticks_per_run_per_invocation must be at least 1".to_string(),
            ));
        }
        if matches!(self.daily_tick_cap, Some(cap) if cap < 0) {
            return Err(KernelError::Validation(
                "daily_tick_cap must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tick accounting of one invocation.
#[derive(Clone, Debug)]
pub struct TickBudget {
    caps: TickCaps,
    used: u32,
    per_run: HashMap<RunId, u32>,
    done: HashSet<RunId>,
}

impl TickBudget {
    pub fn new(caps: TickCaps) -> Self {
        Self {
            caps,
            used: 0,
            per_run: HashMap::new(),
            done: HashSet::new(),
        }
    }

    pub fn caps(&self) -> &TickCaps {
        &self.caps
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn invocation_exhausted(&self) -> bool {
        self.used >= self.caps.max_total_ticks_per_invocation
    }

    pub fn run_exhausted(&self, run_id: &str) -> bool {
        self.per_run.get(run_id).copied().unwrap_or(0) >= self.caps.max_ticks_per_run_per_invocation
    }

    /// True while another step of `run_id` fits in both budgets.
    pub fn allows(&self, run_id: &str) -> bool {
        !self.invocation_exhausted() && !self.run_exhausted(run_id)
    }

    pub fn record_tick(&mut self, run_id: &str) {
        self.used += 1;
        *self.per_run.entry(run_id.to_string()).or_insert(0) += 1;
    }

    /// Excludes `run_id` from further selection in this invocation.
    pub fn finish(&mut self, run_id: &str) {
        self.done.insert(run_id.to_string());
    }

    pub fn is_finished(&self, run_id: &str) -> bool {
        self.done.contains(run_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleReason {
    NoRunnableRuns,
    LaneDisabled,
    InvocationCapReached,
    DailyCapReached,
    LeaseConflict,
}

impl IdleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRunnableRuns => "no_runnable_runs",
            Self::LaneDisabled => "lane_disabled",
            Self::InvocationCapReached => "invocation_cap_reached",
            Self::DailyCapReached => "daily_cap_reached",
            Self::LeaseConflict => "lease_conflict",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulerDecision {
    Dispatch(RunId),
    Idle(IdleReason),
}

#[derive(Clone)]
pub struct Scheduler {
    runs: RunStore,
    kill_switch: KillSwitch,
    counters: DailyCounters,
}

impl Scheduler {
    pub fn new(runs: RunStore, kill_switch: KillSwitch, counters: DailyCounters) -> Self {
        Self {
            runs,
            kill_switch,
            counters,
        }
    }

    /// Oldest runnable run of `(env, lane)` within `budget`, or why there is none.
    pub fn next_runnable(
        &self,
        env: &str,
        lane: &str,
        budget: &TickBudget,
    ) -> Result<SchedulerDecision, KernelError> {
        if budget.invocation_exhausted() {
            return Ok(SchedulerDecision::Idle(IdleReason::InvocationCapReached));
        }
        if self.kill_switch.is_engaged(lane)? {
            debug!(env, lane, "lane disabled by kill switch");
            return Ok(SchedulerDecision::Idle(IdleReason::LaneDisabled));
        }
        if let Some(cap) = budget.caps().daily_tick_cap {
            if self.counters.ticks_today(CounterScope::Lane, lane)? >= cap {
                return Ok(SchedulerDecision::Idle(IdleReason::DailyCapReached));
            }
        }
        let next = self
            .runs
            .runnable_run_ids(env, lane)?
            .into_iter()
            .find(|run_id| !budget.is_finished(run_id));
        Ok(match next {
            Some(run_id) => SchedulerDecision::Dispatch(run_id),
            None => SchedulerDecision::Idle(IdleReason::NoRunnableRuns),
        })
    }

    /// Plain form of [Scheduler::next_runnable] with a fresh budget.
    pub fn next_runnable_run(
        &self,
        env: &str,
        lane: &str,
        caps: &TickCaps,
    ) -> Result<Option<RunId>, KernelError> {
        match self.next_runnable(env, lane, &TickBudget::new(caps.clone()))? {
            SchedulerDecision::Dispatch(run_id) => Ok(Some(run_id)),
            SchedulerDecision::Idle(_) => Ok(None),
        }
    }
}
