use chrono::{DateTime, Utc};
use cp_adapters::{ProcessEventKind, ProcessRole, ProcessStatus};
use cp_core::{WorkflowId, WorkflowState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tagged `ControlPlaneEvent` type, the classifier's output. Facade-emitted lifecycle events (`Created`,
/// `Paused`, `Resumed`) never go through the classifier — they are
/// published directly by `cp-control-plane`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowCreated,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCompleted,
    WorkflowFailed,
    CoordinatorSpawned,
    ObserverSpawned,
    WorkerSpawned,
    CoordinatorOutput,
    ObserverOutput,
    WorkerOutput,
    CoordinatorReplaced,
    WorkerRetired,
    TaskFailed,
    UserNotification,
    CoordinatorIncoming,
    WorkerIncoming,
    FabricPosted,
    CommandLog,
    Unknown,
    HealthRecoveryStarted,
    HealthRecoverySuccess,
    HealthRecoveryFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowCreated => "workflow.created",
            Self::WorkflowPaused => "workflow.paused",
            Self::WorkflowResumed => "workflow.resumed",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::CoordinatorSpawned => "coordinator.spawned",
            Self::ObserverSpawned => "observer.spawned",
            Self::WorkerSpawned => "worker.spawned",
            Self::CoordinatorOutput => "coordinator.output",
            Self::ObserverOutput => "observer.output",
            Self::WorkerOutput => "worker.output",
            Self::CoordinatorReplaced => "coordinator.replaced",
            Self::WorkerRetired => "worker.retired",
            Self::TaskFailed => "task.failed",
            Self::UserNotification => "user.notification",
            Self::CoordinatorIncoming => "coordinator.incoming",
            Self::WorkerIncoming => "worker.incoming",
            Self::FabricPosted => "fabric.posted",
            Self::CommandLog => "command.log",
            Self::Unknown => "unknown",
            Self::HealthRecoveryStarted => "health.recovery.started",
            Self::HealthRecoverySuccess => "health.recovery.success",
            Self::HealthRecoveryFailed => "health.recovery.failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified event carrying workflow context, ready for cross-workflow
/// fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub at: DateTime<Utc>,
    pub workflow_id: WorkflowId,
    pub template_id: String,
    pub workflow_name: Option<String>,
    pub state: WorkflowState,
    pub process_id: Option<String>,
    pub task_id: Option<String>,
    pub payload: Option<Value>,
}

/// Point-in-time workflow context the classifier stamps onto every event
/// it emits ("workflow context (WorkflowID, TemplateID,
/// WorkflowName, current State)").
#[derive(Debug, Clone)]
pub struct WorkflowContextSnapshot {
    pub workflow_id: WorkflowId,
    pub template_id: String,
    pub workflow_name: Option<String>,
    pub state: WorkflowState,
}

/// Pure classification: raw `ProcessEventKind` + optional role → tagged
/// `EventType` ("the classifier is a pure function").
pub fn classify(kind: &ProcessEventKind, role: Option<ProcessRole>) -> EventType {
    use ProcessEventKind::*;
    match kind {
        ProcessSpawned => match role {
            Some(ProcessRole::Coordinator) => EventType::CoordinatorSpawned,
            Some(ProcessRole::Observer) => EventType::ObserverSpawned,
            _ => EventType::WorkerSpawned,
        },
        ProcessOutput { .. } => match role {
            Some(ProcessRole::Coordinator) => EventType::CoordinatorOutput,
            Some(ProcessRole::Observer) => EventType::ObserverOutput,
            _ => EventType::WorkerOutput,
        },
        ProcessStatusChange { status } if *status == ProcessStatus::Retired => match role {
            Some(ProcessRole::Coordinator) => EventType::CoordinatorReplaced,
            _ => EventType::WorkerRetired,
        },
        ProcessStatusChange { .. } => match role {
            Some(ProcessRole::Coordinator) => EventType::CoordinatorOutput,
            Some(ProcessRole::Observer) => EventType::ObserverOutput,
            _ => EventType::WorkerOutput,
        },
        ProcessReady | ProcessWorking | ProcessTokenUsage { .. } | ProcessQueueChanged { .. } => match role {
            Some(ProcessRole::Coordinator) => EventType::CoordinatorOutput,
            Some(ProcessRole::Observer) => EventType::ObserverOutput,
            _ => EventType::WorkerOutput,
        },
        ProcessWorkflowComplete => EventType::WorkflowCompleted,
        ProcessError { .. } => match role {
            Some(ProcessRole::Worker) => EventType::TaskFailed,
            _ => EventType::CoordinatorOutput,
        },
        ProcessUserNotification { .. } => EventType::UserNotification,
        ProcessIncoming => match role {
            Some(ProcessRole::Coordinator) => EventType::CoordinatorIncoming,
            _ => EventType::WorkerIncoming,
        },
        FabricEvent => EventType::FabricPosted,
        CommandLog => EventType::CommandLog,
    }
}

/// Filter applied by `SubscribeFiltered` ("include-types empty
/// OR ... AND include-workflows empty OR ... AND NOT exclude-types").
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub include_types: Vec<EventType>,
    pub include_workflows: Vec<WorkflowId>,
    pub exclude_types: Vec<EventType>,
}

impl EventFilter {
    pub fn workflow(id: WorkflowId) -> Self {
        Self {
            include_workflows: vec![id],
            ..Default::default()
        }
    }

    pub fn passes(&self, event: &ControlPlaneEvent) -> bool {
        let include_ok = self.include_types.is_empty() || self.include_types.contains(&event.event_type);
        let workflow_ok = self.include_workflows.is_empty() || self.include_workflows.contains(&event.workflow_id);
        let exclude_ok = !self.exclude_types.contains(&event.event_type);
        include_ok && workflow_ok && exclude_ok
    }
}
