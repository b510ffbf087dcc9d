use std::collections::HashMap;

use chrono::{DateTime, Utc};
use cp_core::{WorkflowId, WorkflowInstance, WorkflowState};
use serde::{Deserialize, Serialize};

/// `WorkflowInstance` carries non-serializable runtime handles (cancellation
/// tokens, type-erased resources), so the HTTP surface exposes this
/// projection instead of the aggregate itself.
#[derive(Debug, Serialize)]
pub struct WorkflowView {
    pub id: WorkflowId,
    pub template_id: String,
    pub name: Option<String>,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub port: Option<u16>,
    pub is_locked: bool,
    pub tokens_used: u64,
    pub active_workers: u32,
}

impl From<&WorkflowInstance> for WorkflowView {
    fn from(wf: &WorkflowInstance) -> Self {
        Self {
            id: wf.id,
            template_id: wf.template_id.clone(),
            name: wf.name.clone(),
            state: wf.state,
            created_at: wf.created_at,
            started_at: wf.started_at,
            completed_at: wf.completed_at,
            updated_at: wf.updated_at,
            labels: wf.labels.clone(),
            port: wf.runtime.as_ref().map(|r| r.port),
            is_locked: wf.is_locked,
            tokens_used: wf.metrics.tokens_used,
            active_workers: wf.metrics.active_workers,
        }
    }
}

/// Query parameters for `GET /workflows`.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub state: Option<String>,
    pub template_id: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// Request body for `POST /workflows`. Deliberately
/// thinner than the full `WorkflowSpec`: worktree configuration is opt-in
/// through the nested `worktree` object, matching what a CLI/TUI client
/// would realistically send on day one.
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub template_id: String,
    pub initial_prompt: String,
    pub name: Option<String>,
    pub epic_id: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub worktree: Option<WorktreeRequestDto>,
}

#[derive(Debug, Deserialize)]
pub struct WorktreeRequestDto {
    #[serde(default)]
    pub enabled: bool,
    pub base_branch: Option<String>,
    pub branch_name: Option<String>,
}

impl From<CreateWorkflowRequest> for cp_core::WorkflowSpec {
    fn from(req: CreateWorkflowRequest) -> Self {
        cp_core::WorkflowSpec {
            template_id: req.template_id,
            initial_prompt: req.initial_prompt,
            name: req.name,
            work_dir: None,
            epic_id: req.epic_id,
            labels: req.labels,
            worktree: req
                .worktree
                .map(|w| cp_core::WorktreeRequest {
                    enabled: w.enabled,
                    base_branch: w.base_branch,
                    branch_name: w.branch_name,
                })
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StopParams {
    #[serde(default)]
    pub force: bool,
    pub grace_period_secs: Option<u64>,
}
