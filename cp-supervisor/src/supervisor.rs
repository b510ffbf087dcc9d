use std::path::PathBuf;
use std::sync::Arc;

use cp_adapters::{
    AgentProvider, Command, FabricBroker, FabricFactory, FabricLogger, Infrastructure,
    InfrastructureConfig, InfrastructureFactory, Role, Session, SessionFactory, SessionStatus,
    WorktreeError, WorktreeRunner,
};
use cp_core::{ControlPlaneError, Result, RuntimeHandles, WorkflowInstance, WorkflowState};
use cp_eventbus::{ActiveWorkersSink, ContextProvider, EventBus};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::http::{bind_listener, HttpServerHandle};
use crate::resources::SupervisorResources;

/// Options for `Shutdown`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownOptions {
    pub force: bool,
    pub grace_period: Option<std::time::Duration>,
}

/// The only component that touches per-workflow resources: infrastructure,
/// HTTP server, TCP listener, worktree, session directory.
pub struct Supervisor {
    worktree: Option<Arc<dyn WorktreeRunner>>,
    sessions: Arc<dyn SessionFactory>,
    infra_factory: Arc<dyn InfrastructureFactory>,
    fabric_factory: Arc<dyn FabricFactory>,
    coordinator: Arc<dyn AgentProvider>,
    observer: Option<Arc<dyn AgentProvider>>,
    event_bus: Arc<EventBus>,
    config: SupervisorConfig,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish()
    }
}

impl Supervisor {
    pub fn new(
        worktree: Option<Arc<dyn WorktreeRunner>>,
        sessions: Arc<dyn SessionFactory>,
        infra_factory: Arc<dyn InfrastructureFactory>,
        fabric_factory: Arc<dyn FabricFactory>,
        coordinator: Arc<dyn AgentProvider>,
        observer: Option<Arc<dyn AgentProvider>>,
        event_bus: Arc<EventBus>,
        config: SupervisorConfig,
    ) -> Self {
        assert_eq!(coordinator.role(), Role::Coordinator, "coordinator provider must be role=coordinator");
        Self {
            worktree,
            sessions,
            infra_factory,
            fabric_factory,
            coordinator,
            observer,
            event_bus,
            config,
        }
    }

    /// Allocates every per-workflow resource in order, rolling
    /// back everything acquired so far the moment a step fails.
    pub async fn allocate_resources(
        &self,
        workflow: &mut WorkflowInstance,
        context: Arc<dyn ContextProvider>,
        active_workers: Arc<dyn ActiveWorkersSink>,
    ) -> Result<()> {
        let cold_resume = workflow.state == WorkflowState::Paused;
        if !matches!(workflow.state, WorkflowState::Pending)
            && !(cold_resume && workflow.session_dir.is_some())
        {
            return Err(ControlPlaneError::InvalidState {
                id: workflow.id,
                state: workflow.state,
                operation: "allocate-resources".to_string(),
            });
        }

        // Step 1: worktree.
        let worktree_path = match self.allocate_worktree(workflow, cold_resume).await {
            Ok(wt) => wt,
            Err(e) => return Err(e),
        };

        // Step 2: TCP listener.
        let (listener, port) = match bind_listener().await {
            Ok(pair) => pair,
            Err(e) => {
                self.release_worktree(workflow, &worktree_path).await;
                return Err(ControlPlaneError::infrastructure("bind listener", e));
            }
        };

        // Step 3: session.
        let work_dir = worktree_path
            .as_ref()
            .map(|(path, _)| path.clone())
            .or_else(|| workflow.work_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        let session = match self.allocate_session(workflow, cold_resume, &work_dir).await {
            Ok(s) => s,
            Err(e) => {
                self.release_worktree(workflow, &worktree_path).await;
                return Err(e);
            }
        };

        // Step 4: infrastructure.
        let infra_config = InfrastructureConfig {
            workflow_id: workflow.id.to_string(),
            port,
            session_dir: session.dir().to_path_buf(),
        };
        let infra = match self.infra_factory.build(infra_config).await {
            Ok(infra) => Arc::from(infra),
            Err(e) => {
                let _ = session.close(SessionStatus::Failed).await;
                self.release_worktree(workflow, &worktree_path).await;
                return Err(ControlPlaneError::infrastructure("build infrastructure", e));
            }
        };

        // Step 5: wire observability — fabric pipeline, then attach to the
        // cross-workflow event bus. The chain is: persistent event logger
        // (`FabricLogger`), notification broker (`FabricBroker`), forwarder
        // (the event bus's own attach, which republishes classified events).
        let (fabric_broker, fabric_logger): (Arc<dyn FabricBroker>, Arc<dyn FabricLogger>) =
            match self.fabric_factory.build(session.dir()).await {
                Ok((broker, logger)) => (Arc::from(broker), Arc::from(logger)),
                Err(e) => {
                    let _ = infra.drain().await;
                    let _ = session.close(SessionStatus::Failed).await;
                    self.release_worktree(workflow, &worktree_path).await;
                    return Err(ControlPlaneError::infrastructure("build fabric pipeline", e));
                }
            };
        if let Err(e) = session.attach_v2_event_bus().await {
            warn!(id = %workflow.id, error = %e, "attach session to event bus failed");
        }
        if let Err(e) = session.attach_mcp_broker().await {
            warn!(id = %workflow.id, error = %e, "attach mcp broker failed");
        }
        if let Some(events) = infra.take_events() {
            self.event_bus.attach_workflow(workflow.id, events, context, active_workers);
        }

        // Step 6: start the command processor under a fresh root context,
        // independent of the caller's.
        let cancel = CancellationToken::new();
        if let Err(e) = infra.start(cancel.clone()).await {
            self.event_bus.detach_workflow(workflow.id);
            let _ = fabric_broker.stop().await;
            let _ = fabric_logger.close().await;
            let _ = infra.drain().await;
            let _ = session.close(SessionStatus::Failed).await;
            self.release_worktree(workflow, &worktree_path).await;
            return Err(ControlPlaneError::infrastructure("start command processor", e));
        }

        // Step 7: HTTP server.
        let http = HttpServerHandle::serve(listener, infra.clone());

        // Step 8: publish handles atomically.
        if let Some((path, branch)) = &worktree_path {
            workflow.worktree_realized.path = Some(path.clone());
            workflow.worktree_realized.actual_branch = Some(branch.clone());
            workflow.work_dir = Some(path.clone());
        }
        workflow.session_dir = Some(session.dir().to_path_buf());
        let resources = SupervisorResources {
            infra,
            fabric_broker,
            fabric_logger,
            session: Arc::from(session),
            http: parking_lot::Mutex::new(Some(http)),
            worktree_path: worktree_path.map(|(path, _)| path),
        };
        workflow.runtime = Some(RuntimeHandles {
            port,
            cancel,
            resources: Arc::new(resources),
        });

        // Step 9: cold-resume restoration. The adapter's own infrastructure
        // factory is responsible for reloading session metadata and
        // rebuilding the process registry from `session_dir`; failures
        // there are its concern to log, not this supervisor's to propagate
        // ("non-fatal").
        if cold_resume {
            info!(id = %workflow.id, "cold-resume restoration delegated to infrastructure factory");
        }

        Ok(())
    }

    async fn allocate_worktree(
        &self,
        workflow: &WorkflowInstance,
        cold_resume: bool,
    ) -> Result<Option<(PathBuf, String)>> {
        if !workflow.worktree_requested.enabled {
            return Ok(None);
        }
        let (Some(runner), Some(repo_root)) = (&self.worktree, &self.config.repo_root) else {
            return Ok(None);
        };

        if cold_resume {
            if let (Some(path), Some(branch)) =
                (&workflow.worktree_realized.path, &workflow.worktree_realized.actual_branch)
            {
                if path.exists() {
                    return Ok(Some((path.clone(), branch.clone())));
                }
            }
        }

        runner.prune_worktrees(repo_root).await;
        let path = runner.determine_worktree_path(repo_root, &workflow.id.to_string());
        let branch = workflow
            .worktree_requested
            .branch_name
            .clone()
            .unwrap_or_else(|| format!("perles-workflow-{}", short_id(workflow)));
        let base_branch = workflow
            .worktree_requested
            .base_branch
            .clone()
            .unwrap_or_else(|| self.config.default_base_branch.clone());

        runner
            .create_worktree_with_context(repo_root, &path, &branch, &base_branch, self.config.worktree_timeout)
            .await
            .map_err(map_worktree_error)?;

        Ok(Some((path, branch)))
    }

    async fn release_worktree(&self, workflow: &WorkflowInstance, worktree: &Option<(PathBuf, String)>) {
        let (Some(runner), Some(repo_root)) = (&self.worktree, &self.config.repo_root) else {
            return;
        };
        if let Some((path, _)) = worktree {
            if let Err(e) = runner.remove_worktree(repo_root, path).await {
                warn!(id = %workflow.id, error = %e, "rollback: failed to remove worktree");
            }
        }
    }

    async fn allocate_session(
        &self,
        workflow: &WorkflowInstance,
        cold_resume: bool,
        work_dir: &std::path::Path,
    ) -> Result<Box<dyn Session>> {
        let result = if cold_resume && self.config.feature_flags.session_resume() {
            if let Some(dir) = &workflow.session_dir {
                self.sessions.reopen(&workflow.id.to_string(), dir).await
            } else {
                self.sessions.create(&workflow.id.to_string(), work_dir).await
            }
        } else {
            self.sessions.create(&workflow.id.to_string(), work_dir).await
        };
        result.map_err(|e| ControlPlaneError::infrastructure("allocate session", e))
    }

    /// Spawns the coordinator, then (sequentially, fail-open)
    /// the observer, then transition to `running`.
    pub async fn spawn_coordinator(&self, workflow: &mut WorkflowInstance) -> Result<()> {
        if workflow.state != WorkflowState::Pending {
            return Err(ControlPlaneError::InvalidState {
                id: workflow.id,
                state: workflow.state,
                operation: "spawn-coordinator".to_string(),
            });
        }
        let infra = self.infra_of(workflow)?;

        let command = Command::new(
            "spawn_coordinator",
            json!({
                "role": "coordinator",
                "client_name": self.coordinator.client_name(),
                "extensions": self.coordinator.extensions(),
                "prompt_override": workflow.initial_prompt,
            }),
        );
        infra
            .submit_and_wait(command)
            .await
            .map_err(|e| ControlPlaneError::infrastructure("spawn coordinator", e))?;

        if let Some(observer) = &self.observer {
            let command = Command::new(
                "spawn_observer",
                json!({
                    "role": "observer",
                    "client_name": observer.client_name(),
                    "extensions": observer.extensions(),
                }),
            );
            if let Err(e) = infra.submit_and_wait(command).await {
                warn!(id = %workflow.id, error = %e, "observer spawn failed (fail-open)");
            }
        }

        workflow.transition_to(WorkflowState::Running)
    }

    /// Pauses first, then quiesces the infrastructure.
    pub async fn pause(&self, workflow: &mut WorkflowInstance) -> Result<()> {
        if workflow.state != WorkflowState::Running {
            return Err(ControlPlaneError::InvalidState {
                id: workflow.id,
                state: workflow.state,
                operation: "pause".to_string(),
            });
        }
        workflow.transition_to(WorkflowState::Paused)?;

        if let Ok(infra) = self.infra_of(workflow) {
            if let Err(e) = infra.submit(Command::new("clear_queue", json!({}))).await {
                warn!(id = %workflow.id, error = %e, "clear queue on pause failed (swallowed)");
            }
            if let Err(e) = infra.submit(Command::new("pause_all", json!({}))).await {
                warn!(id = %workflow.id, error = %e, "pause_all failed (swallowed)");
            }
        }

        Ok(())
    }

    /// Transitions first, resumes workers before the
    /// coordinator, notify the coordinator, rolling back on any failure.
    pub async fn resume(&self, workflow: &mut WorkflowInstance) -> Result<()> {
        if workflow.state != WorkflowState::Paused {
            return Err(ControlPlaneError::InvalidState {
                id: workflow.id,
                state: workflow.state,
                operation: "resume".to_string(),
            });
        }
        workflow.transition_to(WorkflowState::Running)?;

        let outcome = self.resume_infrastructure(workflow).await;
        if let Err(e) = outcome {
            workflow.transition_to(WorkflowState::Paused)?;
            return Err(e);
        }
        Ok(())
    }

    async fn resume_infrastructure(&self, workflow: &WorkflowInstance) -> Result<()> {
        let infra = self.infra_of(workflow)?;
        infra
            .submit_and_wait(Command::new("resume_workers", json!({})))
            .await
            .map_err(|e| ControlPlaneError::infrastructure("resume workers", e))?;
        infra
            .submit_and_wait(Command::new("resume_coordinator", json!({})))
            .await
            .map_err(|e| ControlPlaneError::infrastructure("resume coordinator", e))?;
        infra
            .submit(Command::new(
                "send_to_coordinator",
                json!({ "message": "Workflow resumed: re-orient on current state before continuing." }),
            ))
            .await
            .map_err(|e| ControlPlaneError::infrastructure("notify coordinator of resume", e))?;
        Ok(())
    }

    /// Shuts down in precise reverse order, tolerating a
    /// cold-resume paused workflow that never allocated runtime resources.
    pub async fn shutdown(&self, workflow: &mut WorkflowInstance, opts: ShutdownOptions) -> Result<()> {
        if !workflow.state.can_transition_to(WorkflowState::Failed) {
            return Err(ControlPlaneError::InvalidState {
                id: workflow.id,
                state: workflow.state,
                operation: "shutdown".to_string(),
            });
        }

        if let Some(resources) = self.resources_of(workflow) {
            // Step 1: uncommitted-changes precheck.
            if !opts.force {
                if let Some(path) = &resources.worktree_path {
                    if let Some(runner) = &self.worktree {
                        match runner.has_uncommitted_changes(path).await {
                            Ok(true) => {
                                return Err(ControlPlaneError::UncommittedChanges { id: workflow.id });
                            }
                            Ok(false) => {}
                            Err(e) => warn!(id = %workflow.id, error = %e, "uncommitted-changes check failed (ignored)"),
                        }
                    }
                }
            }

            // Step 2: fabric broker + logger.
            if let Err(e) = resources.fabric_broker.stop().await {
                warn!(id = %workflow.id, error = %e, "stop fabric broker failed");
            }
            if let Err(e) = resources.fabric_logger.close().await {
                warn!(id = %workflow.id, error = %e, "close fabric logger failed");
            }

            // Step 3: close session.
            let status = if opts.force { SessionStatus::Failed } else { SessionStatus::Completed };
            if let Err(e) = resources.session.close(status).await {
                warn!(id = %workflow.id, error = %e, "close session failed");
            }

            // Step 4: HTTP server.
            if let Some(http) = resources.http.lock().take() {
                if opts.force {
                    http.close();
                } else {
                    let grace = opts.grace_period.unwrap_or(self.config.shutdown_grace_period);
                    http.shutdown(grace).await;
                }
            }

            // Step 5: infrastructure.
            let infra_result = if opts.force { resources.infra.drain().await } else { resources.infra.shutdown().await };
            if let Err(e) = infra_result {
                warn!(id = %workflow.id, error = %e, "infrastructure shutdown failed");
            }

            // Optional: remove the worktree if the `remove-worktree` feature
            // flag is enabled.
            if self.config.feature_flags.remove_worktree() {
                if let (Some(path), Some(runner), Some(repo_root)) =
                    (&resources.worktree_path, &self.worktree, &self.config.repo_root)
                {
                    if let Err(e) = runner.remove_worktree(repo_root, path).await {
                        warn!(id = %workflow.id, error = %e, "shutdown: failed to remove worktree");
                    }
                }
            }

            self.event_bus.detach_workflow(workflow.id);
        }

        // Step 6: cancel the workflow's root context.
        if let Some(runtime) = &workflow.runtime {
            runtime.cancel.cancel();
        }

        // Step 7: terminal transition (user-initiated stop is a failure).
        workflow.transition_to(WorkflowState::Failed)?;

        // Step 8: clear runtime handles.
        workflow.runtime = None;

        Ok(())
    }

    fn infra_of(&self, workflow: &WorkflowInstance) -> Result<Arc<dyn Infrastructure>> {
        let resources = self.resources_of(workflow).ok_or(ControlPlaneError::InvalidState {
            id: workflow.id,
            state: workflow.state,
            operation: "access infrastructure".to_string(),
        })?;
        Ok(resources.infra.clone())
    }

    fn resources_of<'a>(&self, workflow: &'a WorkflowInstance) -> Option<&'a SupervisorResources> {
        let runtime = workflow.runtime.as_ref()?;
        SupervisorResources::downcast(&runtime.resources)
    }
}

fn short_id(workflow: &WorkflowInstance) -> String {
    let s = workflow.id.to_string();
    s.chars().take(8).collect()
}

fn map_worktree_error(e: WorktreeError) -> ControlPlaneError {
    match e {
        WorktreeError::BranchAlreadyCheckedOut { branch } => ControlPlaneError::WorktreeBranchConflict { branch },
        WorktreeError::PathAlreadyExists { path } => ControlPlaneError::WorktreePathConflict { path },
        WorktreeError::Timeout { timeout_secs } => ControlPlaneError::WorktreeTimeout { timeout_secs },
        WorktreeError::Command(msg) => ControlPlaneError::infrastructure("worktree command", anyhow::anyhow!(msg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_adapters::testkit::{
        FakeFabricFactory, FakeInfrastructureFactory, FakeSessionFactory, FakeWorktreeRunner,
        WorktreeErrorKind,
    };
    use cp_adapters::StaticAgentProvider;
    use cp_core::{WorkflowId, WorkflowSpec, WorkflowState};
    use cp_eventbus::WorkflowContextSnapshot;

    #[derive(Debug)]
    struct FixedContext(WorkflowId);

    impl ContextProvider for FixedContext {
        fn snapshot(&self) -> WorkflowContextSnapshot {
            WorkflowContextSnapshot {
                workflow_id: self.0,
                template_id: "t".to_string(),
                workflow_name: None,
                state: WorkflowState::Running,
            }
        }
    }

    #[derive(Debug, Default)]
    struct NullSink;

    impl ActiveWorkersSink for NullSink {
        fn increment(&self, _id: WorkflowId) {}
        fn decrement(&self, _id: WorkflowId) {}
    }

    fn coordinator_provider() -> Arc<dyn AgentProvider> {
        Arc::new(StaticAgentProvider::new(Role::Coordinator, "test-coordinator", vec![]))
    }

    fn supervisor(infra_factory: Arc<FakeInfrastructureFactory>) -> Supervisor {
        Supervisor::new(
            None,
            Arc::new(FakeSessionFactory),
            infra_factory,
            Arc::new(FakeFabricFactory),
            coordinator_provider(),
            None,
            Arc::new(EventBus::new()),
            SupervisorConfig::default(),
        )
    }

    fn pending_workflow(tmp: &std::path::Path) -> WorkflowInstance {
        let spec = WorkflowSpec::new("t", "do the thing").unwrap();
        let mut wf = WorkflowInstance::new(&spec);
        wf.work_dir = Some(tmp.to_path_buf());
        wf
    }

    #[tokio::test]
    async fn allocate_resources_publishes_runtime_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let infra_factory = Arc::new(FakeInfrastructureFactory::default());
        let sup = supervisor(infra_factory.clone());
        let mut wf = pending_workflow(tmp.path());

        sup.allocate_resources(&mut wf, Arc::new(FixedContext(wf.id)), Arc::new(NullSink))
            .await
            .unwrap();

        assert!(wf.runtime.is_some());
        assert!(wf.session_dir.is_some());
        assert_eq!(infra_factory.built.lock().len(), 1);
    }

    #[tokio::test]
    async fn allocate_resources_rejects_running_workflow() {
        let tmp = tempfile::tempdir().unwrap();
        let infra_factory = Arc::new(FakeInfrastructureFactory::default());
        let sup = supervisor(infra_factory);
        let mut wf = pending_workflow(tmp.path());
        wf.transition_to(WorkflowState::Running).unwrap();

        let err = sup
            .allocate_resources(&mut wf, Arc::new(FixedContext(wf.id)), Arc::new(NullSink))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn spawn_coordinator_submits_before_observer_and_transitions_running() {
        let tmp = tempfile::tempdir().unwrap();
        let infra_factory = Arc::new(FakeInfrastructureFactory::default());
        let observer = Arc::new(StaticAgentProvider::new(Role::Observer, "test-observer", vec![]));
        let sup = Supervisor::new(
            None,
            Arc::new(FakeSessionFactory),
            infra_factory.clone(),
            Arc::new(FakeFabricFactory),
            coordinator_provider(),
            Some(observer),
            Arc::new(EventBus::new()),
            SupervisorConfig::default(),
        );
        let mut wf = pending_workflow(tmp.path());
        sup.allocate_resources(&mut wf, Arc::new(FixedContext(wf.id)), Arc::new(NullSink))
            .await
            .unwrap();

        sup.spawn_coordinator(&mut wf).await.unwrap();

        assert_eq!(wf.state, WorkflowState::Running);
        let infra = infra_factory.built.lock()[0].clone();
        let names = infra.submitted_names();
        assert_eq!(names, vec!["spawn_coordinator", "spawn_observer"]);
    }

    #[tokio::test]
    async fn observer_spawn_failure_is_fail_open() {
        let tmp = tempfile::tempdir().unwrap();
        let infra_factory = Arc::new(FakeInfrastructureFactory::default());
        let observer = Arc::new(StaticAgentProvider::new(Role::Observer, "test-observer", vec![]));
        let sup = Supervisor::new(
            None,
            Arc::new(FakeSessionFactory),
            infra_factory.clone(),
            Arc::new(FakeFabricFactory),
            coordinator_provider(),
            Some(observer),
            Arc::new(EventBus::new()),
            SupervisorConfig::default(),
        );
        let mut wf = pending_workflow(tmp.path());
        sup.allocate_resources(&mut wf, Arc::new(FixedContext(wf.id)), Arc::new(NullSink))
            .await
            .unwrap();

        let infra = infra_factory.built.lock()[0].clone();
        infra.fail_next("spawn_observer");

        sup.spawn_coordinator(&mut wf).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Running);
        // The failed observer command never reaches `submitted` (the fake
        // records a command only once it succeeds past the injected failure).
        assert_eq!(infra.submitted_names(), vec!["spawn_coordinator"]);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_through_infra_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let infra_factory = Arc::new(FakeInfrastructureFactory::default());
        let sup = supervisor(infra_factory.clone());
        let mut wf = pending_workflow(tmp.path());
        sup.allocate_resources(&mut wf, Arc::new(FixedContext(wf.id)), Arc::new(NullSink))
            .await
            .unwrap();
        sup.spawn_coordinator(&mut wf).await.unwrap();

        sup.pause(&mut wf).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Paused);
        assert!(wf.paused_at.is_some());

        sup.resume(&mut wf).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Running);

        let infra = infra_factory.built.lock()[0].clone();
        let names = infra.submitted_names();
        assert!(names.contains(&"clear_queue".to_string()));
        assert!(names.contains(&"pause_all".to_string()));
        assert!(names.contains(&"resume_workers".to_string()));
        assert!(names.contains(&"resume_coordinator".to_string()));
    }

    #[tokio::test]
    async fn resume_rolls_back_to_paused_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let infra_factory = Arc::new(FakeInfrastructureFactory::default());
        let sup = supervisor(infra_factory.clone());
        let mut wf = pending_workflow(tmp.path());
        sup.allocate_resources(&mut wf, Arc::new(FixedContext(wf.id)), Arc::new(NullSink))
            .await
            .unwrap();
        sup.spawn_coordinator(&mut wf).await.unwrap();
        sup.pause(&mut wf).await.unwrap();

        let infra = infra_factory.built.lock()[0].clone();
        infra.fail_next("resume_workers");

        let err = sup.resume(&mut wf).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Infrastructure { .. }));
        assert_eq!(wf.state, WorkflowState::Paused);
    }

    #[tokio::test]
    async fn shutdown_clears_runtime_and_transitions_to_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let infra_factory = Arc::new(FakeInfrastructureFactory::default());
        let sup = supervisor(infra_factory);
        let mut wf = pending_workflow(tmp.path());
        sup.allocate_resources(&mut wf, Arc::new(FixedContext(wf.id)), Arc::new(NullSink))
            .await
            .unwrap();
        sup.spawn_coordinator(&mut wf).await.unwrap();

        sup.shutdown(&mut wf, ShutdownOptions { force: true, grace_period: None })
            .await
            .unwrap();

        assert_eq!(wf.state, WorkflowState::Failed);
        assert!(wf.runtime.is_none());
    }

    #[tokio::test]
    async fn worktree_branch_conflict_surfaces_as_domain_error() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_root = tmp.path().to_path_buf();
        let worktree_runner = Arc::new(FakeWorktreeRunner::default());
        worktree_runner.fail_next_create(WorktreeErrorKind::BranchConflict);

        let mut config = SupervisorConfig::default();
        config.repo_root = Some(repo_root);

        let sup = Supervisor::new(
            Some(worktree_runner),
            Arc::new(FakeSessionFactory),
            Arc::new(FakeInfrastructureFactory::default()),
            Arc::new(FakeFabricFactory),
            coordinator_provider(),
            None,
            Arc::new(EventBus::new()),
            config,
        );

        let spec = WorkflowSpec::new("t", "do the thing").unwrap();
        let mut wf = WorkflowInstance::new(&spec);
        wf.work_dir = Some(tmp.path().to_path_buf());
        wf.worktree_requested.enabled = true;

        let err = sup
            .allocate_resources(&mut wf, Arc::new(FixedContext(wf.id)), Arc::new(NullSink))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::WorktreeBranchConflict { .. }));
        assert!(wf.runtime.is_none());
    }
}
