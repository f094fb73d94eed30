//! Conductor: a run-orchestration engine.
//!
//! Runs are small step-dependency graphs. Workers call
//! [Engine::tick_once](runtime::Engine::tick_once) to advance them a bounded
//! number of steps at a time under per-run leases; every state change lands in
//! an ordered event trail and every tick is audited.
//!
//! This crate re-exports the two workspace members:
//! - [kernel]: identities, run and event models, errors, the step handler and
//!   artifact contracts, built-in handlers;
//! - [runtime]: the SQLite store, the orchestration components and the
//!   [Engine](runtime::Engine) facade.

pub use conductor_kernel as kernel;
pub use conductor_runtime as runtime;

pub use conductor_kernel::{
    KernelError, NewRun, RunFilter, RunGraph, RunStatus, StepContext, StepError, StepHandler,
    StepHandlerRegistry, StepOutput, StepSpec,
};
pub use conductor_runtime::{Engine, EngineBuilder, EngineConfig, TickCaps, TickResult, TickStatus};
