use crate::WorkflowId;
use crate::state::WorkflowState;

/// Domain error kinds surfaced across the orchestration kernel.
///
/// Domain errors carry enough context (workflow id, state, underlying
/// cause) to diagnose without a debugger. Infrastructure-layer failures
/// reaching the core are wrapped with the operation name rather than
/// losing their cause.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("invalid spec: {reason}")]
    InvalidSpec { reason: String },

    #[error("workflow {id} not found")]
    WorkflowNotFound { id: WorkflowId },

    #[error("workflow {id} in state {state:?} cannot {operation}")]
    InvalidState {
        id: WorkflowId,
        state: WorkflowState,
        operation: String,
    },

    #[error("workflow {id} cannot transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        id: WorkflowId,
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error("workflow {id} has uncommitted changes in its worktree")]
    UncommittedChanges { id: WorkflowId },

    #[error("persistence error during {operation}: {source}")]
    Persistence {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("worktree branch {branch} is already checked out")]
    WorktreeBranchConflict { branch: String },

    #[error("worktree path {path} already exists")]
    WorktreePathConflict { path: String },

    #[error("worktree operation timed out after {timeout_secs}s")]
    WorktreeTimeout { timeout_secs: u64 },

    #[error("invalid recovery action: {reason}")]
    InvalidRecoveryAction { reason: String },

    #[error("{operation} failed: {source}")]
    Infrastructure {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ControlPlaneError {
    pub fn persistence(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Persistence {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn infrastructure(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Infrastructure {
            operation: operation.into(),
            source: source.into(),
        }
    }

    /// True for errors that never mutate state before returning.
    pub fn is_non_mutating(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. } | Self::InvalidStateTransition { .. }
        )
    }
}
