use serde::{Deserialize, Serialize};

/// Lifecycle state of a workflow.
///
/// The only legal edges are:
///
/// ```text
/// pending   -> running | stopped | failed
/// running   -> paused  | completed | failed | stopped
/// paused    -> running | stopped | failed
/// completed, failed, stopped -> (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl WorkflowState {
    /// `completed|failed|stopped` are terminal: no transition is legal out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Pure predicate mirroring the edge table above. Does not mutate anything.
    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        use WorkflowState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, target),
            (Pending, Running) | (Pending, Stopped) | (Pending, Failed)
                | (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Stopped)
                | (Paused, Running) | (Paused, Stopped) | (Paused, Failed)
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}
