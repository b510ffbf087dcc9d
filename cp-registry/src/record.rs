use chrono::{DateTime, TimeZone, Utc};
use cp_core::{Metrics, WorkflowInstance, WorkflowState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// The persisted `state` vocabulary is one wider than `WorkflowState`: a
/// prior daemon generation could mark a row `timed_out` before this crate
/// existed. The durable registry folds that value into `failed` at its
/// boundary rather than losing rows whose
/// state predates the in-memory enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "timed_out" => Self::TimedOut,
            _ => return None,
        })
    }

    /// `timed_out` is lossily mapped onto `failed`.
    pub fn to_workflow_state(self) -> WorkflowState {
        match self {
            Self::Pending => WorkflowState::Pending,
            Self::Running => WorkflowState::Running,
            Self::Paused => WorkflowState::Paused,
            Self::Completed => WorkflowState::Completed,
            Self::Failed | Self::TimedOut => WorkflowState::Failed,
        }
    }
}

impl From<WorkflowState> for SessionState {
    fn from(s: WorkflowState) -> Self {
        match s {
            WorkflowState::Pending => Self::Pending,
            WorkflowState::Running => Self::Running,
            WorkflowState::Paused => Self::Paused,
            WorkflowState::Completed => Self::Completed,
            WorkflowState::Failed | WorkflowState::Stopped => Self::Failed,
        }
    }
}

/// The persisted projection of a workflow, scoped by `(project, guid)`
///. Timestamps are stored as Unix seconds; this struct keeps
/// them as `DateTime<Utc>` and the repository converts at the SQL boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub guid: String,
    pub project: String,
    pub name: Option<String>,
    pub template_id: Option<String>,
    pub epic_id: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub labels: HashMap<String, String>,

    pub worktree_enabled: bool,
    pub worktree_base_branch: Option<String>,
    pub worktree_branch_name: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub worktree_actual_branch: Option<String>,

    pub session_dir: Option<PathBuf>,

    pub owner_created_pid: Option<u32>,
    pub owner_current_pid: Option<u32>,

    pub tokens_used: u64,
    pub active_workers: u32,

    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub state: SessionState,
}

impl SessionRecord {
    /// Projects a fresh `WorkflowInstance` into an unsaved record (`id=0`)
    /// for a given project and owning PID.
    pub fn from_instance(project: &str, instance: &WorkflowInstance, pid: u32) -> Self {
        Self {
            id: 0,
            guid: instance.id.to_string(),
            project: project.to_string(),
            name: instance.name.clone(),
            template_id: Some(instance.template_id.clone()),
            epic_id: instance.epic_id.clone(),
            work_dir: instance.work_dir.clone(),
            labels: instance.labels.clone(),
            worktree_enabled: instance.worktree_requested.enabled,
            worktree_base_branch: instance.worktree_requested.base_branch.clone(),
            worktree_branch_name: instance.worktree_requested.branch_name.clone(),
            worktree_path: instance.worktree_realized.path.clone(),
            worktree_actual_branch: instance.worktree_realized.actual_branch.clone(),
            session_dir: instance.session_dir.clone(),
            owner_created_pid: Some(pid),
            owner_current_pid: Some(pid),
            tokens_used: instance.metrics.tokens_used,
            active_workers: instance.metrics.active_workers,
            last_heartbeat_at: Some(instance.last_heartbeat_at),
            last_progress_at: Some(instance.last_progress_at),
            started_at: instance.started_at,
            paused_at: instance.paused_at,
            completed_at: instance.completed_at,
            archived_at: instance.archived_at,
            deleted_at: instance.deleted_at,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            state: instance.state.into(),
        }
    }

    /// Overwrites the mutable projection of `record` from `instance`,
    /// keeping identity (`id`, `guid`, `project`) and ownership untouched.
    pub fn apply_instance(&mut self, instance: &WorkflowInstance) {
        self.name = instance.name.clone();
        self.template_id = Some(instance.template_id.clone());
        self.epic_id = instance.epic_id.clone();
        self.work_dir = instance.work_dir.clone();
        self.labels = instance.labels.clone();
        self.worktree_enabled = instance.worktree_requested.enabled;
        self.worktree_base_branch = instance.worktree_requested.base_branch.clone();
        self.worktree_branch_name = instance.worktree_requested.branch_name.clone();
        self.worktree_path = instance.worktree_realized.path.clone();
        self.worktree_actual_branch = instance.worktree_realized.actual_branch.clone();
        self.session_dir = instance.session_dir.clone();
        self.tokens_used = instance.metrics.tokens_used;
        self.active_workers = instance.metrics.active_workers;
        self.last_heartbeat_at = Some(instance.last_heartbeat_at);
        self.last_progress_at = Some(instance.last_progress_at);
        self.started_at = instance.started_at;
        self.paused_at = instance.paused_at;
        self.completed_at = instance.completed_at;
        self.archived_at = instance.archived_at;
        self.deleted_at = instance.deleted_at;
        self.updated_at = instance.updated_at;
        self.state = instance.state.into();
    }

    /// Reconstitutes a "cold" `WorkflowInstance` (runtime fields nil) from
    /// this record, for reload after a daemon restart.
    pub fn to_cold_instance(&self) -> Option<WorkflowInstance> {
        let id = self.guid.parse().ok()?;
        Some(WorkflowInstance {
            id,
            template_id: self.template_id.clone().unwrap_or_default(),
            name: self.name.clone(),
            work_dir: self.work_dir.clone(),
            initial_prompt: String::new(),
            epic_id: self.epic_id.clone(),
            labels: self.labels.clone(),
            worktree_requested: cp_core::WorktreeRequest {
                enabled: self.worktree_enabled,
                base_branch: self.worktree_base_branch.clone(),
                branch_name: self.worktree_branch_name.clone(),
            },
            worktree_realized: cp_core::WorktreeRealized {
                path: self.worktree_path.clone(),
                actual_branch: self.worktree_actual_branch.clone(),
            },
            state: self.state.to_workflow_state(),
            created_at: self.created_at,
            started_at: self.started_at,
            paused_at: self.paused_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
            last_heartbeat_at: self.last_heartbeat_at.unwrap_or(self.created_at),
            last_progress_at: self.last_progress_at.unwrap_or(self.created_at),
            archived_at: self.archived_at,
            deleted_at: self.deleted_at,
            session_dir: self.session_dir.clone(),
            runtime: None,
            is_locked: false,
            metrics: Metrics {
                tokens_used: self.tokens_used,
                active_workers: self.active_workers,
            },
        })
    }

    pub fn archive(&mut self) {
        self.archived_at = Some(Utc::now());
        self.updated_at = self.archived_at.unwrap();
    }

    pub fn soft_delete(&mut self) {
        let now = Utc::now();
        self.deleted_at = Some(now);
        self.updated_at = now;
    }
}

pub(crate) fn to_unix(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp())
}

pub(crate) fn from_unix(t: Option<i64>) -> Option<DateTime<Utc>> {
    t.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}
