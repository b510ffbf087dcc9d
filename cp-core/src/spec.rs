use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::{ControlPlaneError, Result};

/// Immutable creation parameters for a new workflow.
///
/// Validation runs once at construction (`WorkflowSpec::new`) and again
/// right before persistence (`validate`), since a spec may be carried
/// across a process boundary between the two points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub template_id: String,
    pub initial_prompt: String,
    pub name: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub epic_id: Option<String>,
    pub labels: HashMap<String, String>,
    pub worktree: WorktreeRequest,
}

/// Requested worktree behavior; realized values live on `WorkflowInstance`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorktreeRequest {
    pub enabled: bool,
    pub base_branch: Option<String>,
    pub branch_name: Option<String>,
}

impl WorkflowSpec {
    pub fn new(template_id: impl Into<String>, initial_prompt: impl Into<String>) -> Result<Self> {
        let spec = Self {
            template_id: template_id.into(),
            initial_prompt: initial_prompt.into(),
            name: None,
            work_dir: None,
            epic_id: None,
            labels: HashMap::new(),
            worktree: WorktreeRequest::default(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Re-run right before persistence: a spec may have been deserialized
    /// from an untrusted source between construction and `Create`.
    pub fn validate(&self) -> Result<()> {
        if self.template_id.trim().is_empty() {
            return Err(ControlPlaneError::InvalidSpec {
                reason: "template_id is required".to_string(),
            });
        }
        if self.initial_prompt.trim().is_empty() {
            return Err(ControlPlaneError::InvalidSpec {
                reason: "initial_prompt is required".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_template_id() {
        let err = WorkflowSpec::new("", "do the thing").unwrap_err();
        assert!(err.to_string().contains("template_id is required"));
    }

    #[test]
    fn rejects_empty_prompt() {
        let err = WorkflowSpec::new("t", "").unwrap_err();
        assert!(err.to_string().contains("initial_prompt is required"));
    }

    #[test]
    fn accepts_minimal_valid_spec() {
        let spec = WorkflowSpec::new("t", "p").unwrap();
        assert_eq!(spec.template_id, "t");
        assert_eq!(spec.initial_prompt, "p");
    }
}
