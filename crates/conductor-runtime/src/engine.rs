//! The engine facade: every component wired on one shared [SqliteStore].

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use conductor_kernel::{
    event_types, ArtifactWriter, AuditEntry, AuditFilter, AuditRecord, Clock, ConfigVersion,
    EventCursor, EventRecord, FsArtifactWriter, KernelError, KillSwitchState, NewRun, Page,
    RunCursor, RunError, RunFilter, RunId, RunStateRecord, RunStatus, RunSummary,
    StepHandlerRegistry, SystemClock,
};

use crate::audit::{actor_or_system, AuditLog};
use crate::config::EngineConfig;
use crate::config_registry::{ConfigRegistry, KillSwitch};
use crate::counters::DailyCounters;
use crate::event_log::{insert_event, EventLog, EventSubscription};
use crate::executor::GraphExecutor;
use crate::lease::{LeaseManager, SqliteLeaseManager};
use crate::run_store::{insert_run, load_run, load_state, save_state, update_run_progress, RunStore};
use crate::scheduler::{Scheduler, TickCaps};
use crate::store::SqliteStore;
use crate::tick::{TickCoordinator, TickResult};

pub use crate::audit::SYSTEM_ACTOR;

/// Builds an [Engine] with optional overrides of the clock, the step handler
/// registry and the artifact writer.
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    handlers: Option<StepHandlerRegistry>,
    artifacts: Option<Arc<dyn ArtifactWriter>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            handlers: None,
            artifacts: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the built-in registry (`noop`, `fail`, `write_artifact`).
    pub fn step_handlers(mut self, handlers: StepHandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactWriter>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn build(self) -> Result<Engine, KernelError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| KernelError::Validation(e.to_string()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let handlers = Arc::new(self.handlers.unwrap_or_else(StepHandlerRegistry::with_builtins));
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(FsArtifactWriter::new(config.artifact_dir.clone())));

        let store = SqliteStore::open(&config.database_path, config.busy_timeout())?;
        let runs = RunStore::new(store.clone(), clock.clone());
        let events = EventLog::new(store.clone(), clock.clone(), config.event_channel_capacity);
        let leases = Arc::new(SqliteLeaseManager::new(store.clone(), clock.clone()));
        let configs = ConfigRegistry::new(store.clone(), clock.clone());
        let kill_switch = KillSwitch::new(configs.clone());
        let counters = DailyCounters::new(store.clone(), clock.clone());
        let audit = AuditLog::new(store.clone(), clock.clone());
        let scheduler = Scheduler::new(runs.clone(), kill_switch.clone(), counters.clone());
        let executor = GraphExecutor::new(
            store.clone(),
            events.clone(),
            handlers.clone(),
            artifacts,
            clock.clone(),
        );
        let coordinator = TickCoordinator::new(
            scheduler.clone(),
            leases.clone(),
            executor.clone(),
            audit.clone(),
            counters.clone(),
            config.lease_ttl(),
        );
        info!(database = %config.database_path, "engine opened");
        Ok(Engine {
            config,
            store,
            clock,
            handlers,
            runs,
            events,
            leases,
            configs,
            kill_switch,
            counters,
            audit,
            scheduler,
            executor,
            coordinator,
        })
    }
}

#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    store: SqliteStore,
    clock: Arc<dyn Clock>,
    handlers: Arc<StepHandlerRegistry>,
    runs: RunStore,
    events: EventLog,
    leases: Arc<SqliteLeaseManager>,
    configs: ConfigRegistry,
    kill_switch: KillSwitch,
    counters: DailyCounters,
    audit: AuditLog,
    scheduler: Scheduler,
    executor: GraphExecutor,
    coordinator: TickCoordinator,
}

impl Engine {
    /// Opens the store named by `config` with the system clock, the built-in
    /// step handlers and a filesystem artifact writer.
    pub fn open(config: EngineConfig) -> Result<Self, KernelError> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Validates and persists a new `pending` run together with its
    /// `run_created` event.
    pub fn create_run(&self, new_run: NewRun) -> Result<RunId, KernelError> {
        let target = format!("{}/{}", new_run.env, new_run.lane);
        let payload = json!({
            "env": new_run.env,
            "lane": new_run.lane,
            "job_type": new_run.job_type,
            "mode": new_run.mode,
            "parent_run_id": new_run.parent_run_id,
        });
        let outcome = self.insert_new_run(&new_run);
        let payload = match &outcome {
            Ok(run_id) => with_field(payload, "run_id", json!(run_id)),
            Err(_) => payload,
        };
        self.record_outcome("create_run", &new_run.requested_by, &target, payload, &outcome);
        outcome
    }

    fn insert_new_run(&self, new_run: &NewRun) -> Result<RunId, KernelError> {
        new_run.validate()?;
        self.handlers.check_graph(&new_run.job_type, &new_run.run_graph)?;
        let run_id = format!("run-{}", Uuid::new_v4());
        let now = self.clock.now();
        let event = self.store.with_transaction(|tx| {
            insert_run(tx, &run_id, new_run, now)?;
            insert_event(
                tx,
                &run_id,
                event_types::RUN_CREATED,
                &json!({
                    "job_type": new_run.job_type,
                    "mode": new_run.mode,
                    "requested_by": new_run.requested_by,
                    "parent_run_id": new_run.parent_run_id,
                }),
                now,
            )
        })?;
        self.events.publish(std::slice::from_ref(&event));
        info!(
            run_id = %run_id,
            env = %new_run.env,
            lane = %new_run.lane,
            job_type = %new_run.job_type,
            "run created"
        );
        Ok(run_id)
    }

    pub fn tick_once(&self, env: &str, lane: &str, owner_id: &str, caps: &TickCaps) -> TickResult {
        self.coordinator.tick_once(env, lane, owner_id, caps)
    }

    /// `tick_once` with the configured default caps.
    pub fn tick(&self, env: &str, lane: &str, owner_id: &str) -> TickResult {
        self.coordinator
            .tick_once(env, lane, owner_id, &self.config.default_caps)
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunSummary, KernelError> {
        self.runs
            .get(run_id)?
            .ok_or_else(|| KernelError::NotFound(format!("run {}", run_id)))
    }

    pub fn get_run_state(&self, run_id: &str) -> Result<RunStateRecord, KernelError> {
        self.runs
            .get_state(run_id)?
            .ok_or_else(|| KernelError::NotFound(format!("run {}", run_id)))
    }

    /// Newest-first page of runs. `cursor` is the `next_cursor` of the
    /// previous page.
    pub fn list_runs(
        &self,
        filter: &RunFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<RunSummary>, KernelError> {
        let cursor = cursor.map(RunCursor::decode).transpose()?;
        self.runs.list(filter, cursor.as_ref(), limit)
    }

    /// Oldest-first page of the events of `run_id`.
    pub fn list_events(
        &self,
        run_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<EventRecord>, KernelError> {
        let cursor = cursor.map(EventCursor::decode).transpose()?;
        if !self.runs.exists(run_id)? {
            return Err(KernelError::NotFound(format!("run {}", run_id)));
        }
        self.events.replay(run_id, cursor.as_ref(), limit)
    }

    pub fn subscribe_events(&self, run_id: &str) -> Result<EventSubscription, KernelError> {
        if !self.runs.exists(run_id)? {
            return Err(KernelError::NotFound(format!("run {}", run_id)));
        }
        self.events.subscribe(run_id)
    }

    pub fn activate_config(&self, kind: &str, blob: Value, actor: &str) -> Result<i64, KernelError> {
        let outcome = self.configs.activate(kind, blob, actor);
        let payload = match &outcome {
            Ok(version) => json!({"kind": kind, "version": version}),
            Err(_) => json!({"kind": kind}),
        };
        self.record_outcome("activate_config", actor, kind, payload, &outcome);
        outcome
    }

    /// Makes an existing older version of `kind` the active one again.
    pub fn reactivate_config(&self, kind: &str, version: i64, actor: &str) -> Result<(), KernelError> {
        let outcome = self.configs.reactivate(kind, version);
        self.record_outcome(
            "reactivate_config",
            actor,
            kind,
            json!({"kind": kind, "version": version}),
            &outcome,
        );
        outcome
    }

    pub fn get_active_config(&self, kind: &str) -> Result<Option<Value>, KernelError> {
        self.configs.get_active(kind)
    }

    pub fn list_config_versions(&self, kind: &str) -> Result<Vec<ConfigVersion>, KernelError> {
        self.configs.list_versions(kind)
    }

    pub fn set_kill_switch(
        &self,
        lane: &str,
        engaged: bool,
        reason: &str,
        actor: &str,
    ) -> Result<i64, KernelError> {
        let outcome = self.kill_switch.set(lane, engaged, reason, actor);
        self.record_outcome(
            "set_kill_switch",
            actor,
            lane,
            json!({"lane": lane, "engaged": engaged, "reason": reason}),
            &outcome,
        );
        outcome
    }

    pub fn kill_switch_status(&self, lane: &str) -> Result<KillSwitchState, KernelError> {
        self.kill_switch.status(lane)
    }

    /// Administratively fails a non-terminal run. An in-flight step of that
    /// run is discarded at commit time.
    pub fn cancel_run(&self, run_id: &str, actor: &str, reason: &str) -> Result<RunSummary, KernelError> {
        let outcome = self.cancel_in_tx(run_id, actor, reason);
        self.record_outcome(
            "cancel_run",
            actor,
            run_id,
            json!({"run_id": run_id, "reason": reason}),
            &outcome,
        );
        let (run, event) = outcome?;
        self.events.publish(std::slice::from_ref(&event));
        info!(run_id, actor, reason, "run cancelled");
        Ok(run)
    }

    fn cancel_in_tx(
        &self,
        run_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<(RunSummary, EventRecord), KernelError> {
        let now = self.clock.now();
        self.store.with_transaction(|tx| {
            let mut run = load_run(tx, run_id)?
                .ok_or_else(|| KernelError::NotFound(format!("run {}", run_id)))?;
            if run.status.is_terminal() {
                return Err(KernelError::Validation(format!(
                    "run {} is already {}",
                    run_id, run.status
                )));
            }
            let state = load_state(tx, run_id)?
                .map(|record| record.state)
                .unwrap_or_default();
            let message = if reason.trim().is_empty() {
                format!("cancelled by {}", actor)
            } else {
                reason.to_string()
            };
            run.status = RunStatus::Failed;
            run.finished_at = Some(now);
            run.last_error = Some(RunError {
                stage: "cancelled".to_string(),
                step_id: None,
                step_type: None,
                kind: "cancelled".to_string(),
                message: message.clone(),
            });
            update_run_progress(tx, &run)?;
            save_state(tx, run_id, &state, now)?;
            let event = insert_event(
                tx,
                run_id,
                event_types::RUN_FAILED,
                &json!({"reason": "cancelled", "actor": actor, "message": message}),
                now,
            )?;
            Ok((run, event))
        })
    }

    pub fn list_audit(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditEntry>, KernelError> {
        self.audit.list(filter, limit)
    }

    /// Deletes expired lease rows. Returns how many were removed.
    pub fn sweep_expired_leases(&self) -> Result<u64, KernelError> {
        self.leases.sweep_expired(self.clock.now())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn step_handlers(&self) -> &StepHandlerRegistry {
        &self.handlers
    }

    pub fn run_store(&self) -> &RunStore {
        &self.runs
    }

    pub fn event_log(&self) -> &EventLog {
        &self.events
    }

    pub fn leases(&self) -> &SqliteLeaseManager {
        &self.leases
    }

    pub fn config_registry(&self) -> &ConfigRegistry {
        &self.configs
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub fn counters(&self) -> &DailyCounters {
        &self.counters
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn executor(&self) -> &GraphExecutor {
        &self.executor
    }

    pub fn coordinator(&self) -> &TickCoordinator {
        &self.coordinator
    }

    fn record_outcome<T>(
        &self,
        action: &str,
        actor: &str,
        target: &str,
        payload: Value,
        outcome: &Result<T, KernelError>,
    ) {
        let actor = actor_or_system(actor);
        let record = match outcome {
            Ok(_) => AuditRecord::new(action, "success", actor),
            Err(err) => AuditRecord::new(action, "error", actor)
                .error(json!({"code": err.code(), "message": err.to_string()})),
        };
        self.audit.record(record.target(target).payload(payload));
    }
}

fn with_field(mut payload: Value, key: &str, value: Value) -> Value {
    if let Some(object) = payload.as_object_mut() {
        object.insert(key.to_string(), value);
    }
    payload
}
