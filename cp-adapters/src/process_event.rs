use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of the process that raised a [`ProcessEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Coordinator,
    Observer,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Active,
    Retired,
    Paused,
    Failed,
}

/// The raw, per-workflow event kind a supervised process (or the fabric, or
/// the command log) can raise. `cp-eventbus` classifies these into tagged
/// `ControlPlaneEvent`s; adapters never see the classification table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessEventKind {
    ProcessSpawned,
    ProcessOutput { text: String },
    ProcessStatusChange { status: ProcessStatus },
    ProcessReady,
    ProcessWorking,
    ProcessTokenUsage { tokens: u64 },
    ProcessQueueChanged { depth: usize },
    ProcessWorkflowComplete,
    ProcessError { message: String },
    ProcessUserNotification { message: String },
    ProcessIncoming,
    FabricEvent,
    CommandLog,
}

/// A raw event as emitted onto a workflow's internal event bus, before
/// cross-workflow classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub kind: ProcessEventKind,
    pub role: Option<ProcessRole>,
    pub process_id: Option<String>,
    pub task_id: Option<String>,
    pub payload: Option<Value>,
    pub at: DateTime<Utc>,
}

impl ProcessEvent {
    pub fn new(kind: ProcessEventKind, role: Option<ProcessRole>) -> Self {
        Self {
            kind,
            role,
            process_id: None,
            task_id: None,
            payload: None,
            at: Utc::now(),
        }
    }
}
