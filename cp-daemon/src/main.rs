use std::sync::Arc;

use cp_adapters::testkit::{FakeFabricFactory, FakeInfrastructureFactory};
use cp_adapters::{AgentProvider, GitWorktreeRunner, PosixProcessProbe, Role, StaticAgentProvider};
use cp_control_plane::{build_registry, ControlPlane};
use cp_daemon::config::DaemonConfig;
use cp_daemon::routes;
use cp_eventbus::EventBus;
use cp_health::SystemClock;
use cp_registry::SqliteSessionRepository;
use cp_supervisor::{Supervisor, SupervisorConfig, ShutdownOptions};
use tokio::signal;
use tracing::info;

/// Brings up the orchestration kernel behind a minimal HTTP/SSE surface
/// and runs it until `Ctrl-C`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("CPD_CONFIG").ok().map(std::path::PathBuf::from);
    let config = DaemonConfig::load(config_path.as_deref())?;
    info!(bind_addr = %config.bind_addr, project = %config.project, "loading control plane");

    let control_plane = build_control_plane(&config).await?;

    let router = routes::router(control_plane.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "cpd listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down control plane");
    control_plane
        .shutdown(ShutdownOptions {
            force: false,
            grace_period: Some(std::time::Duration::from_secs(10)),
        })
        .await?;

    Ok(())
}

/// Wires the kernel's real external collaborators: a sqlite-backed
/// registry, a signal-0 process probe, a git worktree runner, and a
/// filesystem session/fabric pair. The
/// command processor itself (infra/fabric broker internals) is an
/// external collaborator this workspace does not define, so this daemon
/// wires the in-process stand-ins from `cp-adapters::testkit` rather than
/// inventing a process protocol of its own.
async fn build_control_plane(config: &DaemonConfig) -> anyhow::Result<Arc<ControlPlane>> {
    let repo = Arc::new(SqliteSessionRepository::open(&config.sqlite_path).await?);
    let probe = Arc::new(PosixProcessProbe);
    let registry = build_registry(config.project.clone(), repo, probe);

    let worktree = config
        .repo_root
        .as_ref()
        .map(|_| Arc::new(GitWorktreeRunner) as Arc<dyn cp_adapters::WorktreeRunner>);

    let coordinator: Arc<dyn AgentProvider> = Arc::new(StaticAgentProvider::new(
        Role::Coordinator,
        "cpd-coordinator",
        Vec::new(),
    ));

    let event_bus = Arc::new(EventBus::new());
    let supervisor = Arc::new(Supervisor::new(
        worktree,
        Arc::new(cp_adapters::FsSessionFactory),
        Arc::new(FakeInfrastructureFactory::default()),
        Arc::new(FakeFabricFactory),
        coordinator,
        None,
        event_bus.clone(),
        SupervisorConfig {
            repo_root: config.repo_root.clone(),
            feature_flags: cp_adapters::FeatureFlags::new(config.feature_flags.clone()),
            ..SupervisorConfig::default()
        },
    ));

    Ok(ControlPlane::new(
        registry,
        supervisor,
        event_bus,
        config.health.clone(),
        Arc::new(SystemClock),
    )?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
