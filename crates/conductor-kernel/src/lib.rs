//! Conductor Kernel.
//!
//! Minimal complete set of types shared by the orchestration runtime: Run
//! (identity + graph), Run State (per-step checkpoint), Event (append-only
//! trail), Lease, Config Version and Audit Entry, plus the single-method
//! [StepHandler] capability that run graphs dispatch to.

pub mod artifact;
pub mod audit;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod identity;
pub mod lease;
pub mod registry;
pub mod run;
pub mod state;
pub mod step;
pub mod stubs;

pub use artifact::{
    ArtifactError, ArtifactWriter, FsArtifactWriter, InMemoryArtifactWriter,
    WriteArtifactStepHandler,
};
pub use audit::{sanitize_payload, AuditEntry, AuditFilter, AuditRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigVersion, KillSwitchDocument, KillSwitchState, KILL_SWITCH_KIND};
pub use cursor::{EventCursor, Page, RunCursor};
pub use error::KernelError;
pub use event::{event_types, EventRecord};
pub use identity::{OwnerId, RunId, Seq, StepId};
pub use lease::LeaseRecord;
pub use registry::StepHandlerRegistry;
pub use run::{
    NewRun, RunError, RunFilter, RunGraph, RunStatus, RunSummary, StepSpec, RUN_SCHEMA_VERSION,
};
pub use state::{RunState, RunStateRecord, StepState, StepStatus};
pub use step::{StepContext, StepError, StepHandler, StepOutput};
pub use stubs::{FailingStepHandler, NoopStepHandler};
