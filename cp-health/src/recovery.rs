use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cp_adapters::{Command, Infrastructure};
use cp_core::{ControlPlaneError, Result, WorkflowId, WorkflowState};
use cp_eventbus::{ControlPlaneEvent, EventBus, EventType};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::policy::HealthPolicy;
use crate::status::HealthStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Nudge,
    Replace,
    Pause,
    Fail,
}

/// Pure decision function. `None` is the "no action" sentinel.
pub fn determine_recovery_action(
    status: &HealthStatus,
    policy: &HealthPolicy,
    now: DateTime<Utc>,
) -> Option<RecoveryAction> {
    if !status.is_stuck(now, policy.progress_timeout) {
        return None;
    }

    if status.recovery_count >= policy.max_recoveries {
        return if policy.enable_auto_pause {
            Some(RecoveryAction::Fail)
        } else {
            None
        };
    }

    if status.recovery_count < policy.max_nudges && policy.enable_auto_nudge {
        return Some(RecoveryAction::Nudge);
    }

    if status.recovery_count == policy.max_nudges && policy.enable_auto_replace {
        return Some(RecoveryAction::Replace);
    }

    if status.recovery_count == policy.max_nudges + 1 && policy.enable_auto_pause {
        return Some(RecoveryAction::Pause);
    }

    None
}

/// What the executor needs from the orchestration kernel to carry out a
/// recovery action, without depending on `cp-supervisor` or
/// `cp-registry` directly.
#[async_trait]
pub trait RecoveryTarget: Send + Sync + std::fmt::Debug {
    fn state(&self, id: WorkflowId) -> Option<WorkflowState>;
    fn infrastructure(&self, id: WorkflowId) -> Option<Arc<dyn Infrastructure>>;
    async fn transition(&self, id: WorkflowId, target: WorkflowState) -> Result<()>;
}

/// Executes the four recovery actions and emits health events.
#[derive(Debug)]
pub struct RecoveryExecutor {
    target: Arc<dyn RecoveryTarget>,
    bus: Arc<EventBus>,
}

impl RecoveryExecutor {
    pub fn new(target: Arc<dyn RecoveryTarget>, bus: Arc<EventBus>) -> Self {
        Self { target, bus }
    }

    pub async fn execute(&self, id: WorkflowId, action: RecoveryAction) -> Result<()> {
        match action {
            RecoveryAction::Nudge => self.nudge(id).await,
            RecoveryAction::Replace => self.replace(id).await,
            RecoveryAction::Pause => self.pause(id).await,
            RecoveryAction::Fail => self.fail(id).await,
        }
    }

    async fn nudge(&self, id: WorkflowId) -> Result<()> {
        if self.target.state(id) != Some(WorkflowState::Running) {
            return Err(ControlPlaneError::InvalidState {
                id,
                state: self.target.state(id).unwrap_or(WorkflowState::Failed),
                operation: "nudge".to_string(),
            });
        }
        let Some(infra) = self.target.infrastructure(id) else {
            return Err(ControlPlaneError::InvalidRecoveryAction {
                reason: "no infrastructure submitter for nudge".to_string(),
            });
        };

        self.publish(id, EventType::HealthRecoveryStarted, None);
        let command = Command::new("send_to_coordinator", json!({ "message": "Health check" }));
        match infra.submit_and_wait(command).await {
            Ok(_) => {
                self.publish(id, EventType::HealthRecoverySuccess, None);
                Ok(())
            }
            Err(e) => {
                self.publish(id, EventType::HealthRecoveryFailed, Some(e.to_string()));
                Ok(())
            }
        }
    }

    async fn replace(&self, id: WorkflowId) -> Result<()> {
        let Some(infra) = self.target.infrastructure(id) else {
            return Err(ControlPlaneError::InvalidRecoveryAction {
                reason: "no infrastructure submitter for replace".to_string(),
            });
        };

        self.publish(id, EventType::HealthRecoveryStarted, None);
        let command = Command::new(
            "replace_process",
            json!({ "role": "coordinator", "reason": "stuck workflow recovery" }),
        );
        match infra.submit_and_wait(command).await {
            Ok(_) => {
                self.publish(id, EventType::HealthRecoverySuccess, None);
                Ok(())
            }
            Err(e) => {
                self.publish(id, EventType::HealthRecoveryFailed, Some(e.to_string()));
                Ok(())
            }
        }
    }

    async fn pause(&self, id: WorkflowId) -> Result<()> {
        if self.target.state(id) != Some(WorkflowState::Running) {
            return Err(ControlPlaneError::InvalidState {
                id,
                state: self.target.state(id).unwrap_or(WorkflowState::Failed),
                operation: "health-triggered pause".to_string(),
            });
        }
        self.publish(id, EventType::HealthRecoveryStarted, None);
        match self.target.transition(id, WorkflowState::Paused).await {
            Ok(()) => {
                self.publish(id, EventType::HealthRecoverySuccess, None);
                Ok(())
            }
            Err(e) => {
                self.publish(id, EventType::HealthRecoveryFailed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn fail(&self, id: WorkflowId) -> Result<()> {
        let state = self.target.state(id);
        if matches!(state, Some(WorkflowState::Completed) | Some(WorkflowState::Failed) | Some(WorkflowState::Stopped)) {
            return Err(ControlPlaneError::InvalidState {
                id,
                state: state.unwrap(),
                operation: "health-triggered fail".to_string(),
            });
        }
        self.publish(id, EventType::HealthRecoveryStarted, None);
        match self.target.transition(id, WorkflowState::Failed).await {
            Ok(()) => {
                self.publish(id, EventType::HealthRecoverySuccess, None);
                Ok(())
            }
            Err(e) => {
                self.publish(id, EventType::HealthRecoveryFailed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn publish(&self, id: WorkflowId, event_type: EventType, error_text: Option<String>) {
        let payload = error_text.map(|text| json!({ "error": text }));
        self.bus.publish(ControlPlaneEvent {
            event_type,
            at: Utc::now(),
            workflow_id: id,
            template_id: String::new(),
            workflow_name: None,
            state: self.target.state(id).unwrap_or(WorkflowState::Failed),
            process_id: None,
            task_id: None,
            payload,
        });
        if event_type == EventType::HealthRecoveryFailed {
            warn!(%id, "recovery action failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stuck_status(recovery_count: u32, now: DateTime<Utc>, policy: &HealthPolicy) -> HealthStatus {
        let mut status = HealthStatus::new(now - policy.progress_timeout - chrono::Duration::seconds(1));
        status.recovery_count = recovery_count;
        status
    }

    #[test]
    fn not_stuck_yields_no_action() {
        let policy = HealthPolicy::default();
        let now = Utc::now();
        let status = HealthStatus::new(now);
        assert_eq!(determine_recovery_action(&status, &policy, now), None);
    }

    #[test]
    fn escalation_sequence_matches_worked_example() {
        let policy = HealthPolicy {
            max_nudges: 2,
            max_recoveries: 4,
            ..HealthPolicy::default()
        };
        let now = Utc::now();

        let expected = [
            RecoveryAction::Nudge,
            RecoveryAction::Nudge,
            RecoveryAction::Replace,
            RecoveryAction::Pause,
            RecoveryAction::Fail,
        ];
        for (recovery_count, action) in expected.into_iter().enumerate() {
            let status = stuck_status(recovery_count as u32, now, &policy);
            assert_eq!(
                determine_recovery_action(&status, &policy, now),
                Some(action),
                "recovery_count={recovery_count}"
            );
        }
    }

    #[test]
    fn all_flags_disabled_yields_no_action_even_past_max_recoveries() {
        let policy = HealthPolicy {
            max_nudges: 2,
            max_recoveries: 4,
            enable_auto_nudge: false,
            enable_auto_replace: false,
            enable_auto_pause: false,
            ..HealthPolicy::default()
        };
        let now = Utc::now();
        for recovery_count in 0..6 {
            let status = stuck_status(recovery_count, now, &policy);
            assert_eq!(determine_recovery_action(&status, &policy, now), None);
        }
    }

    #[test]
    fn exhausted_recoveries_beyond_max_stay_failed_gated_by_auto_pause() {
        let policy = HealthPolicy {
            max_nudges: 2,
            max_recoveries: 4,
            ..HealthPolicy::default()
        };
        let now = Utc::now();
        let status = stuck_status(10, now, &policy);
        assert_eq!(determine_recovery_action(&status, &policy, now), Some(RecoveryAction::Fail));
    }
}
