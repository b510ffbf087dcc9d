//! The small adapter layer that lets `cp-eventbus` and `cp-health` reach
//! workflow state and infrastructure without depending on `cp-registry` or
//! `cp-supervisor` directly — the facade is the only crate that wires all
//! three together.

use std::sync::Arc;

use async_trait::async_trait;
use cp_adapters::Infrastructure;
use cp_core::{Result, WorkflowId, WorkflowState};
use cp_eventbus::{ActiveWorkersSink, ContextProvider, WorkflowContextSnapshot};
use cp_health::RecoveryTarget;
use cp_registry::DurableRegistry;
use cp_supervisor::SupervisorResources;
use tracing::warn;

/// Stamps the classifier's event context from whatever this process
/// currently believes about the workflow ("workflow context...
/// current State"). Backed by `DurableRegistry::peek`, so the snapshot
/// always reflects the latest in-memory transition, not the state at
/// attach time.
#[derive(Debug)]
pub struct RegistryContextProvider {
    registry: Arc<DurableRegistry>,
    id: WorkflowId,
}

impl RegistryContextProvider {
    pub fn new(registry: Arc<DurableRegistry>, id: WorkflowId) -> Self {
        Self { registry, id }
    }
}

impl ContextProvider for RegistryContextProvider {
    fn snapshot(&self) -> WorkflowContextSnapshot {
        match self.registry.peek(self.id) {
            Some(wf) => WorkflowContextSnapshot {
                workflow_id: wf.id,
                template_id: wf.template_id,
                workflow_name: wf.name,
                state: wf.state,
            },
            None => WorkflowContextSnapshot {
                workflow_id: self.id,
                template_id: String::new(),
                workflow_name: None,
                state: WorkflowState::Failed,
            },
        }
    }
}

/// Bookkeeping side effect of classification: bumps `Metrics.active_workers`
/// on the live instance.
#[derive(Debug)]
pub struct RegistryActiveWorkersSink {
    registry: Arc<DurableRegistry>,
}

impl RegistryActiveWorkersSink {
    pub fn new(registry: Arc<DurableRegistry>) -> Self {
        Self { registry }
    }
}

impl ActiveWorkersSink for RegistryActiveWorkersSink {
    fn increment(&self, id: WorkflowId) {
        if let Err(e) = self.registry.update(id, |wf| {
            wf.metrics.active_workers = wf.metrics.active_workers.saturating_add(1);
            Ok(())
        }) {
            warn!(%id, error = %e, "active-workers increment on unknown workflow");
        }
    }

    fn decrement(&self, id: WorkflowId) {
        if let Err(e) = self.registry.update(id, |wf| {
            wf.metrics.active_workers = wf.metrics.active_workers.saturating_sub(1);
            Ok(())
        }) {
            warn!(%id, error = %e, "active-workers decrement on unknown workflow");
        }
    }
}

/// What the recovery executor needs from the orchestration kernel, without
/// depending on `cp-supervisor` directly.
#[derive(Debug)]
pub struct FacadeRecoveryTarget {
    registry: Arc<DurableRegistry>,
}

impl FacadeRecoveryTarget {
    pub fn new(registry: Arc<DurableRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RecoveryTarget for FacadeRecoveryTarget {
    fn state(&self, id: WorkflowId) -> Option<WorkflowState> {
        self.registry.peek(id).map(|wf| wf.state)
    }

    fn infrastructure(&self, id: WorkflowId) -> Option<Arc<dyn Infrastructure>> {
        let wf = self.registry.peek(id)?;
        let runtime = wf.runtime?;
        let resources = SupervisorResources::downcast(&runtime.resources)?;
        Some(resources.infra.clone())
    }

    async fn transition(&self, id: WorkflowId, target: WorkflowState) -> Result<()> {
        self.registry.update(id, |wf| wf.transition_to(target))?;
        if let Err(e) = self.registry.persist(id).await {
            warn!(%id, error = %e, "best-effort persist after recovery transition failed");
        }
        Ok(())
    }
}
