//! Kernel error taxonomy.

use thiserror::Error;

use crate::identity::RunId;

/// Errors surfaced by the orchestration API.
///
/// Step handler failures are not represented here: they are [crate::StepError]s
/// and end up as a run-level `failed` status, never as a failed call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    /// Malformed create/tick/list input.
    #[error("validation: {0}")]
    Validation(String),
    /// Unknown run (or other addressed record).
    #[error("not found: {0}")]
    NotFound(String),
    /// Another owner holds (or took over) the lease of this run.
    #[error("lease conflict for run {run_id}")]
    LeaseConflict { run_id: RunId },
    /// Storage unreachable or a statement failed; the enclosing transaction was rolled back.
    #[error("storage: {0}")]
    Storage(String),
}

impl KernelError {
    /// Stable machine-readable code, used in audit error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::LeaseConflict { .. } => "LEASE_CONFLICT",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, Self::LeaseConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(KernelError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(KernelError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(KernelError::Storage("x".into()).code(), "STORAGE_ERROR");
        let conflict = KernelError::LeaseConflict {
            run_id: "run-1".into(),
        };
        assert_eq!(conflict.code(), "LEASE_CONFLICT");
        assert!(conflict.is_lease_conflict());
        assert_eq!(conflict.to_string(), "lease conflict for run run-1");
    }
}
