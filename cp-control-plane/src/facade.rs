use std::sync::Arc;

use async_trait::async_trait;
use cp_adapters::ProcessProbe;
use cp_core::{ControlPlaneError, Result, WorkflowId, WorkflowInstance, WorkflowSpec, WorkflowState};
use cp_eventbus::{ControlPlaneEvent, EventFilter, EventType, LifecycleCallback};
use cp_eventbus::EventBus;
use cp_health::{Clock, HealthMonitor, HealthPolicy, HealthStatus, RecoveryExecutor};
use cp_registry::{DurableRegistry, ListQuery, SessionRepository};
use cp_supervisor::{ShutdownOptions, Supervisor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::{FacadeRecoveryTarget, RegistryActiveWorkersSink, RegistryContextProvider};

/// Top-level orchestration facade: the only type
/// `cp-daemon` talks to. Owns the durable registry, the supervisor, the
/// cross-workflow event bus, and the health monitor, and wires the
/// lifecycle callback and the event-driven progress feed between them.
#[derive(Debug)]
pub struct ControlPlane {
    registry: Arc<DurableRegistry>,
    supervisor: Arc<Supervisor>,
    event_bus: Arc<EventBus>,
    health: Arc<HealthMonitor>,
    health_cancel: CancellationToken,
    progress_cancel: CancellationToken,
}

impl ControlPlane {
    /// Builds the facade and wires the lifecycle callback (on
    /// `workflow.completed`/`workflow.failed`, call `Complete`/`Fail`) and
    /// the progress feed that keeps the health monitor's clocks moving
    /// ("progress... any observed activity").
    pub fn new(
        registry: Arc<DurableRegistry>,
        supervisor: Arc<Supervisor>,
        event_bus: Arc<EventBus>,
        health_policy: HealthPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        health_policy.validate()?;

        let target = Arc::new(FacadeRecoveryTarget::new(registry.clone()));
        let executor = Arc::new(RecoveryExecutor::new(target, event_bus.clone()));
        let health = Arc::new(HealthMonitor::new(health_policy, clock, executor));

        let health_cancel = CancellationToken::new();
        health.clone().spawn(health_cancel.clone());

        let cp = Arc::new(Self {
            registry,
            supervisor,
            event_bus: event_bus.clone(),
            health: health.clone(),
            health_cancel,
            progress_cancel: CancellationToken::new(),
        });

        event_bus.set_lifecycle_callback(cp.clone() as Arc<dyn LifecycleCallback>);
        cp.spawn_progress_feed();

        Ok(cp)
    }

    /// Every classified event is activity; feed it to the health monitor as
    /// both heartbeat and progress ("any observed activity from
    /// the workflow's processes").
    fn spawn_progress_feed(self: &Arc<Self>) {
        let health = self.health.clone();
        let mut rx = self.event_bus.subscribe(self.progress_cancel.clone());
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                health.record_heartbeat(event.workflow_id);
                health.record_progress(event.workflow_id);
            }
        });
    }

    /// `Create`: validate, instantiate, `Put`, publish.
    pub async fn create(&self, spec: WorkflowSpec) -> Result<WorkflowInstance> {
        spec.validate()?;
        let wf = WorkflowInstance::new(&spec);
        self.registry.put(wf.clone()).await?;
        self.publish(&wf, EventType::WorkflowCreated);
        Ok(wf)
    }

    /// `Start`: allocate resources (which attaches to the event
    /// bus as its own last observability step), then spawn the coordinator,
    /// detaching on failure so no dangling attachment survives.
    pub async fn start(&self, id: WorkflowId) -> Result<WorkflowInstance> {
        let mut wf = self.registry.get(id).await?;
        let context = Arc::new(RegistryContextProvider::new(self.registry.clone(), id));
        let sink = Arc::new(RegistryActiveWorkersSink::new(self.registry.clone()));

        self.supervisor.allocate_resources(&mut wf, context, sink).await?;
        self.sync_registry(&wf).await;

        if let Err(e) = self.supervisor.spawn_coordinator(&mut wf).await {
            self.event_bus.detach_workflow(id);
            return Err(e);
        }

        self.health.track(id);
        self.sync_registry(&wf).await;
        Ok(wf)
    }

    /// `Pause`.
    pub async fn pause(&self, id: WorkflowId) -> Result<WorkflowInstance> {
        let mut wf = self.registry.get(id).await?;
        self.supervisor.pause(&mut wf).await?;
        self.sync_registry(&wf).await;
        self.publish(&wf, EventType::WorkflowPaused);
        Ok(wf)
    }

    /// `Resume`, including cold-resume: a paused workflow with no
    /// runtime infrastructure re-allocates resources and re-attaches the
    /// runtime to the durable registry before the normal resume sequence.
    pub async fn resume(&self, id: WorkflowId) -> Result<WorkflowInstance> {
        let mut wf = self.registry.get(id).await?;

        if wf.state == WorkflowState::Paused && wf.is_cold() {
            let context = Arc::new(RegistryContextProvider::new(self.registry.clone(), id));
            let sink = Arc::new(RegistryActiveWorkersSink::new(self.registry.clone()));
            self.supervisor.allocate_resources(&mut wf, context, sink).await?;
            if let Some(runtime) = wf.runtime.clone() {
                self.registry.attach_runtime(id, runtime);
            }
        }

        self.supervisor.resume(&mut wf).await?;
        self.health.track(id);
        self.sync_registry(&wf).await;
        self.publish(&wf, EventType::WorkflowResumed);
        Ok(wf)
    }

    /// `Complete` / `Fail`.
    pub async fn complete(&self, id: WorkflowId) -> Result<WorkflowInstance> {
        self.finish(id, WorkflowState::Completed, EventType::WorkflowCompleted).await
    }

    pub async fn fail(&self, id: WorkflowId) -> Result<WorkflowInstance> {
        self.finish(id, WorkflowState::Failed, EventType::WorkflowFailed).await
    }

    async fn finish(&self, id: WorkflowId, target: WorkflowState, event_type: EventType) -> Result<WorkflowInstance> {
        let wf = self.registry.update(id, |wf| wf.transition_to(target))?;
        if let Err(e) = self.registry.persist(id).await {
            warn!(%id, error = %e, "best-effort persist on terminal transition failed");
        }
        self.health.untrack(id);
        self.publish(&wf, event_type);
        Ok(wf)
    }

    /// `Stop` (internal): pause first (best-effort) so the paused
    /// state is available for a later cold resume, detach from the event
    /// bus, then shut the workflow down.
    pub async fn stop(&self, id: WorkflowId, opts: ShutdownOptions) -> Result<WorkflowInstance> {
        let mut wf = self.registry.get(id).await?;

        if wf.state == WorkflowState::Running {
            if let Err(e) = self.supervisor.pause(&mut wf).await {
                warn!(%id, error = %e, "best-effort pause before stop failed");
            } else {
                self.sync_registry(&wf).await;
            }
        }

        self.event_bus.detach_workflow(id);
        self.health.untrack(id);
        self.supervisor.shutdown(&mut wf, opts).await?;
        self.sync_registry(&wf).await;
        Ok(wf)
    }

    pub async fn get(&self, id: WorkflowId) -> Result<WorkflowInstance> {
        self.registry.get(id).await
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Vec<WorkflowInstance>> {
        self.registry.list(query).await
    }

    pub async fn archive(&self, id: WorkflowId) -> Result<()> {
        self.registry.archive(id).await
    }

    pub fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<ControlPlaneEvent> {
        self.event_bus.subscribe(cancel)
    }

    pub fn subscribe_workflow(&self, id: WorkflowId, cancel: CancellationToken) -> mpsc::Receiver<ControlPlaneEvent> {
        self.event_bus.subscribe_workflow(id, cancel)
    }

    pub fn subscribe_filtered(&self, filter: EventFilter, cancel: CancellationToken) -> mpsc::Receiver<ControlPlaneEvent> {
        self.event_bus.subscribe_filtered(filter, cancel)
    }

    pub fn health_status(&self, id: WorkflowId) -> Option<HealthStatus> {
        self.health.status_of(id)
    }

    /// `Shutdown` (daemon-wide): stop the health monitor, stop
    /// every non-terminal workflow owned by this process, close the event
    /// bus, and aggregate whatever errors come back.
    pub async fn shutdown(&self, opts: ShutdownOptions) -> Result<()> {
        self.health_cancel.cancel();
        self.progress_cancel.cancel();

        let owned = self.registry.list(&ListQuery::default()).await?;
        let mut errors = Vec::new();
        for wf in owned {
            if wf.is_locked {
                continue;
            }
            if !matches!(wf.state, WorkflowState::Running | WorkflowState::Paused | WorkflowState::Pending) {
                continue;
            }
            if let Err(e) = self.stop(wf.id, opts).await {
                warn!(id = %wf.id, error = %e, "daemon shutdown: stop failed");
                errors.push(format!("{}: {e}", wf.id));
            }
        }

        self.event_bus.close();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ControlPlaneError::infrastructure(
                "daemon shutdown",
                anyhow::anyhow!(errors.join("; ")),
            ))
        }
    }

    async fn sync_registry(&self, wf: &WorkflowInstance) {
        let wf = wf.clone();
        let id = wf.id;
        if let Err(e) = self.registry.update(id, move |slot| {
            *slot = wf;
            Ok(())
        }) {
            warn!(%id, error = %e, "best-effort registry sync failed");
            return;
        }
        if let Err(e) = self.registry.persist(id).await {
            warn!(%id, error = %e, "best-effort persist failed");
        }
    }

    fn publish(&self, wf: &WorkflowInstance, event_type: EventType) {
        self.event_bus.publish(ControlPlaneEvent {
            event_type,
            at: chrono::Utc::now(),
            workflow_id: wf.id,
            template_id: wf.template_id.clone(),
            workflow_name: wf.name.clone(),
            state: wf.state,
            process_id: None,
            task_id: None,
            payload: None,
        });
    }
}

#[async_trait]
impl LifecycleCallback for ControlPlane {
    async fn on_completed(&self, id: WorkflowId) {
        if self.registry.peek(id).is_some_and(|wf| wf.can_transition_to(WorkflowState::Completed)) {
            if let Err(e) = self.complete(id).await {
                warn!(%id, error = %e, "lifecycle callback: complete failed");
            }
        }
    }

    async fn on_failed(&self, id: WorkflowId) {
        if self.registry.peek(id).is_some_and(|wf| wf.can_transition_to(WorkflowState::Failed)) {
            if let Err(e) = self.fail(id).await {
                warn!(%id, error = %e, "lifecycle callback: fail failed");
            }
        }
    }
}

/// Constructs a `DurableRegistry` bound to a specific project and process
/// probe; a thin convenience so `cp-daemon` doesn't need to import
/// `cp-registry`'s pieces directly just to wire the facade.
pub fn build_registry(
    project: impl Into<String>,
    repo: Arc<dyn SessionRepository>,
    probe: Arc<dyn ProcessProbe>,
) -> Arc<DurableRegistry> {
    Arc::new(DurableRegistry::new(project, repo, probe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_adapters::testkit::{FakeFabricFactory, FakeInfrastructureFactory, FakeSessionFactory};
    use cp_adapters::{AgentProvider, PosixProcessProbe, Role, StaticAgentProvider};
    use cp_health::{FakeClock, HealthPolicy};
    use cp_registry::SqliteSessionRepository;
    use cp_supervisor::SupervisorConfig;

    async fn control_plane() -> (Arc<ControlPlane>, Arc<FakeInfrastructureFactory>) {
        let repo = Arc::new(SqliteSessionRepository::open_in_memory().await.unwrap());
        let probe: Arc<dyn ProcessProbe> = Arc::new(PosixProcessProbe);
        let registry = build_registry("proj-a", repo, probe);

        let infra_factory = Arc::new(FakeInfrastructureFactory::default());
        let coordinator: Arc<dyn AgentProvider> = Arc::new(StaticAgentProvider::new(Role::Coordinator, "c", vec![]));
        let event_bus = Arc::new(EventBus::new());
        let supervisor = Arc::new(Supervisor::new(
            None,
            Arc::new(FakeSessionFactory),
            infra_factory.clone(),
            Arc::new(FakeFabricFactory),
            coordinator,
            None,
            event_bus.clone(),
            SupervisorConfig::default(),
        ));

        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let cp = ControlPlane::new(registry, supervisor, event_bus, HealthPolicy::default(), clock).unwrap();
        (cp, infra_factory)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (cp, _infra) = control_plane().await;
        let spec = WorkflowSpec::new("t", "p").unwrap();
        let wf = cp.create(spec).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Pending);

        let fetched = cp.get(wf.id).await.unwrap();
        assert_eq!(fetched.id, wf.id);
    }

    #[tokio::test]
    async fn start_attaches_bus_before_spawn_and_transitions_running() {
        let (cp, _infra) = control_plane().await;
        let spec = WorkflowSpec::new("t", "p").unwrap();
        let wf = cp.create(spec).await.unwrap();

        let mut sub = cp.subscribe_workflow(wf.id, CancellationToken::new());
        let started = cp.start(wf.id).await.unwrap();
        assert_eq!(started.state, WorkflowState::Running);
        assert!(started.runtime.is_some());

        let first = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.event_type, EventType::CoordinatorSpawned);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips() {
        let (cp, _infra) = control_plane().await;
        let spec = WorkflowSpec::new("t", "p").unwrap();
        let wf = cp.create(spec).await.unwrap();
        cp.start(wf.id).await.unwrap();

        let paused = cp.pause(wf.id).await.unwrap();
        assert_eq!(paused.state, WorkflowState::Paused);

        let resumed = cp.resume(wf.id).await.unwrap();
        assert_eq!(resumed.state, WorkflowState::Running);
    }

    #[tokio::test]
    async fn stop_pauses_then_fails_and_clears_runtime() {
        let (cp, _infra) = control_plane().await;
        let spec = WorkflowSpec::new("t", "p").unwrap();
        let wf = cp.create(spec).await.unwrap();
        cp.start(wf.id).await.unwrap();

        let stopped = cp.stop(wf.id, ShutdownOptions { force: true, grace_period: None }).await.unwrap();
        assert_eq!(stopped.state, WorkflowState::Failed);
        assert!(stopped.runtime.is_none());
    }

    #[tokio::test]
    async fn lifecycle_callback_completes_on_workflow_completed_event() {
        let (cp, infra_factory) = control_plane().await;
        let spec = WorkflowSpec::new("t", "p").unwrap();
        let wf = cp.create(spec).await.unwrap();
        cp.start(wf.id).await.unwrap();

        let infra = infra_factory.built.lock()[0].clone();
        infra.emit(cp_adapters::ProcessEvent::new(cp_adapters::ProcessEventKind::ProcessWorkflowComplete, None));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let fetched = cp.get(wf.id).await.unwrap();
        assert_eq!(fetched.state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn daemon_shutdown_stops_owned_workflows_and_closes_bus() {
        let (cp, _infra) = control_plane().await;
        let spec = WorkflowSpec::new("t", "p").unwrap();
        let wf = cp.create(spec).await.unwrap();
        cp.start(wf.id).await.unwrap();

        cp.shutdown(ShutdownOptions { force: true, grace_period: None }).await.unwrap();

        let fetched = cp.get(wf.id).await.unwrap();
        assert_eq!(fetched.state, WorkflowState::Failed);
    }
}
