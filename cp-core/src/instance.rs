use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::id::WorkflowId;
use crate::spec::WorkflowSpec;
use crate::state::WorkflowState;
use crate::{ControlPlaneError, Result};

/// Resources a supervisor attaches to a workflow once `AllocateResources`
/// succeeds (command processor, event bus, tool adapter, HTTP server,
/// session handle, fabric broker/logger...). Owned by `cp-supervisor`;
/// `cp-core` only needs to hold, clone, and drop it, so it is type-erased
/// behind this marker trait rather than naming every field here.
pub trait RuntimeResources: Any + Send + Sync + std::fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Realized worktree location, filled in by the supervisor during
/// `AllocateResources`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorktreeRealized {
    pub path: Option<PathBuf>,
    pub actual_branch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub tokens_used: u64,
    pub active_workers: u32,
}

/// Runtime (non-persisted) handles. `None` until `AllocateResources`
/// succeeds; always `None` again after `Shutdown` and for any cold-loaded
/// (reconstituted from persistence) instance whose resources have not yet
/// been re-attached.
#[derive(Debug, Clone)]
pub struct RuntimeHandles {
    pub port: u16,
    pub cancel: CancellationToken,
    pub resources: Arc<dyn RuntimeResources>,
}

/// The aggregate root: identity, configuration, worktree state, lifecycle
/// state, durability hints, runtime handles, and metrics.
#[derive(Debug, Clone)]
pub struct WorkflowInstance {
    // Identity
    pub id: WorkflowId,
    pub template_id: String,
    pub name: Option<String>,

    // Configuration
    pub work_dir: Option<PathBuf>,
    pub initial_prompt: String,
    pub epic_id: Option<String>,
    pub labels: HashMap<String, String>,

    // Worktree
    pub worktree_requested: crate::spec::WorktreeRequest,
    pub worktree_realized: WorktreeRealized,

    // State
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,

    // Durability hints
    pub session_dir: Option<PathBuf>,

    // Runtime (never persisted)
    pub runtime: Option<RuntimeHandles>,
    /// Set by the registry when another live process owns this row.
    pub is_locked: bool,

    // Metrics
    pub metrics: Metrics,
}

impl WorkflowInstance {
    /// Builds a brand-new `pending` instance from a validated spec. Label
    /// map is deep-copied so external mutation of the spec cannot leak in
    ///.
    pub fn new(spec: &WorkflowSpec) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            template_id: spec.template_id.clone(),
            name: spec.name.clone(),
            work_dir: spec.work_dir.clone(),
            initial_prompt: spec.initial_prompt.clone(),
            epic_id: spec.epic_id.clone(),
            labels: spec.labels.clone(),
            worktree_requested: spec.worktree.clone(),
            worktree_realized: WorktreeRealized::default(),
            state: WorkflowState::Pending,
            created_at: now,
            started_at: None,
            paused_at: None,
            completed_at: None,
            updated_at: now,
            last_heartbeat_at: now,
            last_progress_at: now,
            archived_at: None,
            deleted_at: None,
            session_dir: None,
            runtime: None,
            is_locked: false,
            metrics: Metrics::default(),
        }
    }

    /// Applies a legal state transition in place, bumping timestamps.
    /// Returns `invalid-state-transition` otherwise, without mutating
    /// anything.
    pub fn transition_to(&mut self, target: WorkflowState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(ControlPlaneError::InvalidStateTransition {
                id: self.id,
                from: self.state,
                to: target,
            });
        }

        let now = Utc::now();
        self.state = target;
        self.updated_at = now;

        if target == WorkflowState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if matches!(target, WorkflowState::Completed | WorkflowState::Failed) {
            self.completed_at = Some(now);
        }
        if target == WorkflowState::Paused {
            self.paused_at = Some(now);
        }

        Ok(())
    }

    /// Pure check used by callers that want to guard a transition before
    /// attempting it (e.g. the lifecycle callback in the facade).
    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        self.state.can_transition_to(target)
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat_at = Utc::now();
    }

    /// Progress implies heartbeat.
    pub fn record_progress(&mut self) {
        let now = Utc::now();
        self.last_progress_at = now;
        self.last_heartbeat_at = now;
    }

    pub fn add_tokens(&mut self, n: u64) {
        self.metrics.tokens_used = self.metrics.tokens_used.saturating_add(n);
    }

    pub fn is_cold(&self) -> bool {
        self.runtime.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WorkflowSpec {
        WorkflowSpec::new("t", "p").unwrap()
    }

    #[test]
    fn started_at_set_exactly_once() {
        let mut wf = WorkflowInstance::new(&spec());
        wf.transition_to(WorkflowState::Running).unwrap();
        let first = wf.started_at;
        assert!(first.is_some());

        wf.transition_to(WorkflowState::Paused).unwrap();
        wf.transition_to(WorkflowState::Running).unwrap();
        assert_eq!(wf.started_at, first, "re-entering running must not reset started_at");
    }

    #[test]
    fn completed_at_set_only_on_terminal_success_or_failure() {
        let mut wf = WorkflowInstance::new(&spec());
        wf.transition_to(WorkflowState::Running).unwrap();
        assert!(wf.completed_at.is_none());
        wf.transition_to(WorkflowState::Completed).unwrap();
        assert!(wf.completed_at.is_some());
    }

    #[test]
    fn invalid_transition_does_not_mutate() {
        let mut wf = WorkflowInstance::new(&spec());
        let before = wf.updated_at;
        let err = wf.transition_to(WorkflowState::Completed).unwrap_err();
        assert!(matches!(err, ControlPlaneError::InvalidStateTransition { .. }));
        assert_eq!(wf.state, WorkflowState::Pending);
        assert_eq!(wf.updated_at, before);
    }

    #[test]
    fn progress_implies_heartbeat() {
        let mut wf = WorkflowInstance::new(&spec());
        wf.record_progress();
        assert!(wf.last_progress_at <= wf.last_heartbeat_at);
    }

    #[test]
    fn labels_are_deep_copied_from_spec() {
        let mut s = spec();
        s.labels.insert("k".to_string(), "v".to_string());
        let wf = WorkflowInstance::new(&s);
        s.labels.insert("k2".to_string(), "v2".to_string());
        assert_eq!(wf.labels.len(), 1);
    }
}
