use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

use crate::process_event::ProcessEvent;

/// Opaque command submitted to a workflow's command processor. The
/// processor's own command vocabulary (spawn/pause/resume/replace/...) is
/// owned by `cp-supervisor`; adapters only need to move it across the
/// channel and hand back a reply.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub args: Value,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self { name: name.into(), args }
    }
}

/// Configuration handed to an [`InfrastructureFactory`] to build one
/// workflow's command processor + event bus + adapter + process registry
///.
#[derive(Debug, Clone)]
pub struct InfrastructureConfig {
    pub workflow_id: String,
    pub port: u16,
    pub session_dir: std::path::PathBuf,
}

/// A running workflow's infrastructure: command processor, event bus,
/// tool adapter, process registry, bundled behind a uniform lifecycle.
#[async_trait]
pub trait Infrastructure: Send + Sync + fmt::Debug {
    /// Starts the command processor's background consumer loop under
    /// `cancel`. Must return once the loop is listening, not once it exits.
    async fn start(&self, cancel: tokio_util::sync::CancellationToken) -> Result<()>;

    /// Fire-and-forget submission; used for pause/resume/nudge/replace
    /// commands whose result the caller does not await.
    async fn submit(&self, command: Command) -> Result<()>;

    /// Submit and wait for the command's result.
    async fn submit_and_wait(&self, command: Command) -> Result<Value>;

    /// Graceful shutdown: finish in-flight commands, reject new ones.
    async fn shutdown(&self) -> Result<()>;

    /// Immediate shutdown: drop queued commands.
    async fn drain(&self) -> Result<()>;

    /// Hands over the receiving half of this infrastructure's internal
    /// process-event stream. Callable at most once — the cross-workflow
    /// event bus's `attach_workflow` takes ownership of it. Returns `None` on a second call.
    fn take_events(&self) -> Option<mpsc::Receiver<ProcessEvent>>;
}

#[async_trait]
pub trait InfrastructureFactory: Send + Sync + fmt::Debug {
    async fn build(&self, config: InfrastructureConfig) -> Result<Box<dyn Infrastructure>>;
}
