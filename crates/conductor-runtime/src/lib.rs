//! Conductor Runtime.
//!
//! SQLite-backed implementations of the orchestration components and the
//! [Engine] facade that wires them on one shared [SqliteStore]:
//! leases, run store, event log, audit log, config registry and kill switch,
//! daily counters, scheduler, single-step graph executor and the
//! `tick_once` coordinator.

pub mod audit;
pub mod config;
pub mod config_registry;
pub mod counters;
pub mod engine;
pub mod event_log;
pub mod executor;
pub mod lease;
pub mod run_store;
pub mod scheduler;
pub mod store;
pub mod tick;

pub use audit::{AuditLog, MAX_AUDIT_PAGE};
pub use config::{ConfigError, EngineConfig};
pub use config_registry::{ConfigRegistry, KillSwitch};
pub use counters::{CounterScope, DailyCounters, TICKS_KEY};
pub use engine::{Engine, EngineBuilder};
pub use event_log::{EventLog, EventSubscription, MAX_EVENT_PAGE};
pub use executor::{GraphExecutor, StepOutcome, StepReport};
pub use lease::{LeaseManager, SqliteLeaseManager};
pub use run_store::{RunStore, MAX_RUN_PAGE};
pub use scheduler::{IdleReason, Scheduler, SchedulerDecision, TickBudget, TickCaps};
pub use store::SqliteStore;
pub use tick::{TickCoordinator, TickResult, TickStatus};
