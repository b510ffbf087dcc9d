use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Default timeout for `git worktree add` / `remove` operations: a
/// configurable timeout, default 30s.
pub const DEFAULT_WORKTREE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("branch {branch} is already checked out in another worktree")]
    BranchAlreadyCheckedOut { branch: String },
    #[error("path {path} already exists")]
    PathAlreadyExists { path: String },
    #[error("operation timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
    #[error("git command failed: {0}")]
    Command(String),
}

/// Git-worktree command runner. The core depends only on this
/// trait; `GitWorktreeRunner` is the real implementation, `testkit::FakeWorktreeRunner`
/// stands in for it in unit tests that must not touch a real `git` binary.
#[async_trait]
pub trait WorktreeRunner: Send + Sync + std::fmt::Debug {
    /// Best-effort: prune stale worktree references under `repo_root`.
    async fn prune_worktrees(&self, repo_root: &Path);

    /// Deterministic path a new worktree for `workflow_id` would live at.
    fn determine_worktree_path(&self, repo_root: &Path, workflow_id: &str) -> PathBuf;

    async fn create_worktree_with_context(
        &self,
        repo_root: &Path,
        path: &Path,
        branch: &str,
        base_branch: &str,
        timeout: Duration,
    ) -> Result<(), WorktreeError>;

    async fn remove_worktree(&self, repo_root: &Path, path: &Path) -> Result<(), WorktreeError>;

    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool, WorktreeError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GitWorktreeRunner;

impl GitWorktreeRunner {
    async fn run(&self, mut cmd: Command, timeout: Duration, description: &str) -> Result<Output, WorktreeError> {
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(io_err)) => Err(WorktreeError::Command(format!("{description} failed: {io_err}"))),
            Err(_elapsed) => Err(WorktreeError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl WorktreeRunner for GitWorktreeRunner {
    async fn prune_worktrees(&self, repo_root: &Path) {
        let mut cmd = Command::new("git");
        cmd.args(["worktree", "prune"]).current_dir(repo_root);
        if let Err(e) = self.run(cmd, DEFAULT_WORKTREE_TIMEOUT, "git worktree prune").await {
            tracing::warn!(error = %e, "worktree prune failed (best-effort)");
        }
    }

    fn determine_worktree_path(&self, repo_root: &Path, workflow_id: &str) -> PathBuf {
        let short = &workflow_id[..workflow_id.len().min(8)];
        repo_root
            .parent()
            .unwrap_or(repo_root)
            .join(format!(".worktrees/{short}"))
    }

    async fn create_worktree_with_context(
        &self,
        repo_root: &Path,
        path: &Path,
        branch: &str,
        base_branch: &str,
        timeout: Duration,
    ) -> Result<(), WorktreeError> {
        if path.exists() {
            return Err(WorktreeError::PathAlreadyExists {
                path: path.display().to_string(),
            });
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorktreeError::Command(format!("mkdir parent dir: {e}")))?;
        }

        let mut cmd = Command::new("git");
        cmd.args(["worktree", "add", "-b", branch])
            .arg(path)
            .arg(base_branch)
            .current_dir(repo_root);

        let output = self.run(cmd, timeout, "git worktree add").await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already used by worktree") || stderr.contains("already checked out") {
                return Err(WorktreeError::BranchAlreadyCheckedOut {
                    branch: branch.to_string(),
                });
            }
            return Err(WorktreeError::Command(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn remove_worktree(&self, repo_root: &Path, path: &Path) -> Result<(), WorktreeError> {
        let mut cmd = Command::new("git");
        cmd.args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(repo_root);
        let output = self.run(cmd, DEFAULT_WORKTREE_TIMEOUT, "git worktree remove").await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::Command(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool, WorktreeError> {
        let mut cmd = Command::new("git");
        cmd.args(["status", "--porcelain"]).current_dir(path);
        let output = self.run(cmd, DEFAULT_WORKTREE_TIMEOUT, "git status").await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::Command(stderr.trim().to_string()));
        }
        Ok(!output.stdout.is_empty())
    }
}
