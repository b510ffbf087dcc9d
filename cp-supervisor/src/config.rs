use std::path::PathBuf;
use std::time::Duration;

use cp_adapters::FeatureFlags;

/// Static configuration the supervisor needs for worktree allocation.
/// `repo_root` is the git repository every workflow's worktree is created
/// under; `None` on `worktree` disables worktree allocation entirely
/// regardless of what a workflow's template requests.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub repo_root: Option<PathBuf>,
    pub worktree_timeout: Duration,
    pub default_base_branch: String,
    pub shutdown_grace_period: Duration,
    /// Gates `remove-worktree`, `session-resume` ("feature flags
    /// consumed"). Unknown/absent flags default to disabled.
    pub feature_flags: FeatureFlags,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            repo_root: None,
            worktree_timeout: cp_adapters::DEFAULT_WORKTREE_TIMEOUT,
            default_base_branch: "main".to_string(),
            shutdown_grace_period: Duration::from_secs(10),
            feature_flags: FeatureFlags::default(),
        }
    }
}
