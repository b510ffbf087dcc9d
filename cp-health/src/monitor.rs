use std::sync::Arc;

use chrono::{DateTime, Utc};
use cp_core::WorkflowId;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::policy::HealthPolicy;
use crate::recovery::{determine_recovery_action, RecoveryExecutor};
use crate::status::HealthStatus;

/// Tracks heartbeat/progress timestamps for every attached workflow and
/// drives the recovery escalation ladder on a fixed tick.
#[derive(Debug)]
pub struct HealthMonitor {
    statuses: DashMap<WorkflowId, Mutex<HealthStatus>>,
    policy: HealthPolicy,
    clock: Arc<dyn Clock>,
    executor: Arc<RecoveryExecutor>,
}

impl HealthMonitor {
    pub fn new(policy: HealthPolicy, clock: Arc<dyn Clock>, executor: Arc<RecoveryExecutor>) -> Self {
        Self {
            statuses: DashMap::new(),
            policy,
            clock,
            executor,
        }
    }

    /// Begins tracking a workflow. Idempotent: re-tracking resets its status.
    pub fn track(&self, id: WorkflowId) {
        self.statuses.insert(id, Mutex::new(HealthStatus::new(self.clock.now())));
    }

    pub fn untrack(&self, id: WorkflowId) {
        self.statuses.remove(&id);
    }

    pub fn record_heartbeat(&self, id: WorkflowId) {
        if let Some(entry) = self.statuses.get(&id) {
            let mut status = entry.lock();
            status.last_heartbeat_at = self.clock.now();
            status.is_healthy = true;
        }
    }

    /// Any process output/status change counts as progress.
    pub fn record_progress(&self, id: WorkflowId) {
        if let Some(entry) = self.statuses.get(&id) {
            let mut status = entry.lock();
            status.last_progress_at = self.clock.now();
            status.is_healthy = true;
        }
    }

    pub fn status_of(&self, id: WorkflowId) -> Option<HealthStatus> {
        self.statuses.get(&id).map(|entry| entry.lock().clone())
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Runs one evaluation pass over every tracked workflow, executing at
    /// most one recovery action per workflow per tick.
    pub async fn check_once(&self) {
        let now: DateTime<Utc> = self.clock.now();
        let due: Vec<(WorkflowId, crate::recovery::RecoveryAction)> = self
            .statuses
            .iter()
            .filter_map(|entry| {
                let id = *entry.key();
                let mut status = entry.value().lock();
                if !status.backoff_elapsed(now, self.policy.recovery_backoff) {
                    return None;
                }
                let action = determine_recovery_action(&status, &self.policy, now)?;
                status.is_healthy = false;
                status.recovery_count += 1;
                status.last_recovery_at = Some(now);
                Some((id, action))
            })
            .collect();

        for (id, action) in due {
            debug!(%id, ?action, "executing recovery action");
            if let Err(e) = self.executor.execute(id, action).await {
                tracing::warn!(%id, error = %e, "recovery action execution failed");
            }
        }
    }

    /// Spawns the background ticker loop.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.policy.check_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("health monitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.check_once().await;
                    }
                }
            }
        });
    }
}
