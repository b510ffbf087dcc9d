//! Fakes for every external-collaborator trait in this crate, shared
//! across `cp-supervisor`/`cp-control-plane`'s test suites the same way
//! `StaticAgentProvider` is shared for the agent trait. Not `cfg(test)`
//! because these fakes are consumed from other crates' test targets,
//! which only ever see this crate's normal (non-test) compilation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::fabric::{FabricBroker, FabricFactory, FabricLogger};
use crate::infra::{Command, Infrastructure, InfrastructureConfig, InfrastructureFactory};
use crate::process_event::ProcessEvent;
use crate::process_probe::ProcessProbe;
use crate::session::{Session, SessionFactory, SessionStatus};
use crate::worktree::{WorktreeError, WorktreeRunner};

/// Infrastructure double: records every submitted command, replies with a
/// canned result, and exposes the live sender so a test can push
/// `ProcessEvent`s the way a real command processor would.
#[derive(Debug)]
pub struct FakeInfrastructure {
    pub submitted: Mutex<Vec<Command>>,
    events_tx: mpsc::Sender<ProcessEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ProcessEvent>>>,
    started: AtomicBool,
    fail_commands: Mutex<VecDeque<String>>,
}

impl FakeInfrastructure {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            submitted: Mutex::new(Vec::new()),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
            fail_commands: Mutex::new(VecDeque::new()),
        })
    }

    /// The next `submit`/`submit_and_wait` call for this command name fails.
    pub fn fail_next(&self, command_name: impl Into<String>) {
        self.fail_commands.lock().push_back(command_name.into());
    }

    pub fn emit(&self, event: ProcessEvent) {
        let _ = self.events_tx.try_send(event);
    }

    pub fn submitted_names(&self) -> Vec<String> {
        self.submitted.lock().iter().map(|c| c.name.clone()).collect()
    }

    fn maybe_fail(&self, name: &str) -> anyhow::Result<()> {
        let mut fails = self.fail_commands.lock();
        if let Some(pos) = fails.iter().position(|n| n == name) {
            fails.remove(pos);
            anyhow::bail!("fake infrastructure: {name} failed");
        }
        Ok(())
    }
}

#[async_trait]
impl Infrastructure for FakeInfrastructure {
    async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn submit(&self, command: Command) -> anyhow::Result<()> {
        self.maybe_fail(&command.name)?;
        self.submitted.lock().push(command);
        Ok(())
    }

    async fn submit_and_wait(&self, command: Command) -> anyhow::Result<Value> {
        self.maybe_fail(&command.name)?;
        self.submitted.lock().push(command);
        Ok(json!({"ok": true}))
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn drain(&self) -> anyhow::Result<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<ProcessEvent>> {
        self.events_rx.lock().take()
    }
}

#[derive(Debug, Default)]
pub struct FakeInfrastructureFactory {
    pub built: Mutex<Vec<Arc<FakeInfrastructure>>>,
}

#[async_trait]
impl InfrastructureFactory for FakeInfrastructureFactory {
    async fn build(&self, _config: InfrastructureConfig) -> anyhow::Result<Box<dyn Infrastructure>> {
        let infra = FakeInfrastructure::new();
        self.built.lock().push(infra.clone());
        Ok(Box::new(FakeInfrastructureHandle(infra)))
    }
}

/// `Box<dyn Infrastructure>` needs an owned value; this wraps the shared
/// `Arc` the factory keeps for itself so tests can inspect it after the
/// supervisor takes ownership of the boxed trait object.
#[derive(Debug)]
struct FakeInfrastructureHandle(Arc<FakeInfrastructure>);

#[async_trait]
impl Infrastructure for FakeInfrastructureHandle {
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.0.start(cancel).await
    }
    async fn submit(&self, command: Command) -> anyhow::Result<()> {
        self.0.submit(command).await
    }
    async fn submit_and_wait(&self, command: Command) -> anyhow::Result<Value> {
        self.0.submit_and_wait(command).await
    }
    async fn shutdown(&self) -> anyhow::Result<()> {
        self.0.shutdown().await
    }
    async fn drain(&self) -> anyhow::Result<()> {
        self.0.drain().await
    }
    fn take_events(&self) -> Option<mpsc::Receiver<ProcessEvent>> {
        self.0.take_events()
    }
}

/// Worktree runner double: never touches the filesystem or a real `git`
/// binary. Records calls and can be told to fail the next `create`.
#[derive(Debug, Default)]
pub struct FakeWorktreeRunner {
    pub pruned: AtomicUsize,
    pub next_create_error: Mutex<Option<WorktreeErrorKind>>,
}

#[derive(Debug, Clone, Copy)]
pub enum WorktreeErrorKind {
    BranchConflict,
    PathConflict,
    Timeout,
}

impl FakeWorktreeRunner {
    pub fn fail_next_create(&self, kind: WorktreeErrorKind) {
        *self.next_create_error.lock() = Some(kind);
    }
}

#[async_trait]
impl WorktreeRunner for FakeWorktreeRunner {
    async fn prune_worktrees(&self, _repo_root: &Path) {
        self.pruned.fetch_add(1, Ordering::SeqCst);
    }

    fn determine_worktree_path(&self, repo_root: &Path, workflow_id: &str) -> PathBuf {
        let short = &workflow_id[..workflow_id.len().min(8)];
        repo_root.join(format!("fake-worktree-{short}"))
    }

    async fn create_worktree_with_context(
        &self,
        _repo_root: &Path,
        path: &Path,
        branch: &str,
        _base_branch: &str,
        _timeout: Duration,
    ) -> Result<(), WorktreeError> {
        if let Some(kind) = self.next_create_error.lock().take() {
            return Err(match kind {
                WorktreeErrorKind::BranchConflict => WorktreeError::BranchAlreadyCheckedOut {
                    branch: branch.to_string(),
                },
                WorktreeErrorKind::PathConflict => WorktreeError::PathAlreadyExists {
                    path: path.display().to_string(),
                },
                WorktreeErrorKind::Timeout => WorktreeError::Timeout { timeout_secs: 30 },
            });
        }
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| WorktreeError::Command(e.to_string()))?;
        Ok(())
    }

    async fn remove_worktree(&self, _repo_root: &Path, path: &Path) -> Result<(), WorktreeError> {
        let _ = tokio::fs::remove_dir_all(path).await;
        Ok(())
    }

    async fn has_uncommitted_changes(&self, _path: &Path) -> Result<bool, WorktreeError> {
        Ok(false)
    }
}

#[derive(Debug, Default)]
pub struct FakeProcessProbe {
    pub alive: Mutex<std::collections::HashSet<u32>>,
}

impl FakeProcessProbe {
    pub fn mark_alive(&self, pid: u32) {
        self.alive.lock().insert(pid);
    }
}

impl ProcessProbe for FakeProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }
}

#[derive(Debug, Default)]
pub struct FakeSessionFactory;

#[derive(Debug)]
pub struct FakeSession {
    dir: PathBuf,
    closed: AtomicBool,
    pub messages: Mutex<Vec<(String, String)>>,
    pub mcp_requests: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl Session for FakeSession {
    fn dir(&self) -> &Path {
        &self.dir
    }

    async fn attach_v2_event_bus(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn attach_mcp_broker(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn log_message(&self, role: &str, content: &str) -> anyhow::Result<()> {
        self.messages.lock().push((role.to_string(), content.to_string()));
        Ok(())
    }

    async fn log_mcp_request(&self, method: &str, params: &Value) -> anyhow::Result<()> {
        self.mcp_requests.lock().push((method.to_string(), params.clone()));
        Ok(())
    }

    async fn close(&self, _status: SessionStatus) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn create(&self, workflow_id: &str, work_dir: &Path) -> anyhow::Result<Box<dyn Session>> {
        let dir = work_dir.join(".sessions").join(workflow_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Box::new(FakeSession {
            dir,
            closed: AtomicBool::new(false),
            messages: Mutex::new(Vec::new()),
            mcp_requests: Mutex::new(Vec::new()),
        }))
    }

    async fn reopen(&self, _workflow_id: &str, dir: &Path) -> anyhow::Result<Box<dyn Session>> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Box::new(FakeSession {
            dir: dir.to_path_buf(),
            closed: AtomicBool::new(false),
            messages: Mutex::new(Vec::new()),
            mcp_requests: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Debug, Default)]
pub struct FakeFabricBroker {
    pub running: AtomicBool,
}

#[async_trait]
impl FabricBroker for FakeFabricBroker {
    async fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeFabricLogger {
    pub closed: AtomicBool,
}

#[async_trait]
impl FabricLogger for FakeFabricLogger {
    async fn log(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeFabricFactory;

#[async_trait]
impl FabricFactory for FakeFabricFactory {
    async fn build(&self, _session_dir: &Path) -> anyhow::Result<(Box<dyn FabricBroker>, Box<dyn FabricLogger>)> {
        Ok((Box::new(FakeFabricBroker::default()), Box::new(FakeFabricLogger::default())))
    }
}
