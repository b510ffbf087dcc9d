//! External collaborators consumed by the orchestration kernel.
//!
//! Everything here is a trait plus at least one real implementation and,
//! where tests need it, a fake. The kernel crates (`cp-supervisor`,
//! `cp-eventbus`, `cp-health`) depend only on the traits and the event
//! types; `cp-daemon` wires up the real implementations.

pub mod agent;
pub mod fabric;
pub mod feature_flags;
pub mod infra;
pub mod process_event;
pub mod process_probe;
pub mod session;
pub mod testkit;
pub mod worktree;

pub use agent::{AgentProvider, Role, StaticAgentProvider};
pub use fabric::{FabricBroker, FabricFactory, FabricLogger, FsFabricFactory, InProcessFabricBroker};
pub use feature_flags::FeatureFlags;
pub use infra::{Command, Infrastructure, InfrastructureConfig, InfrastructureFactory};
pub use process_event::{ProcessEvent, ProcessEventKind, ProcessRole, ProcessStatus};
pub use process_probe::{PosixProcessProbe, ProcessProbe};
pub use session::{FsSession, FsSessionFactory, Session, SessionFactory, SessionStatus};
pub use worktree::{GitWorktreeRunner, WorktreeError, WorktreeRunner, DEFAULT_WORKTREE_TIMEOUT};
