//! Orchestration kernel data model: workflow identity, the state machine,
//! the creation spec, the aggregate root, and the domain error kinds that
//! every other `cp-*` crate in this workspace shares.

pub mod error;
pub mod id;
pub mod instance;
pub mod spec;
pub mod state;

pub use error::ControlPlaneError;
pub use id::WorkflowId;
pub use instance::{
    Metrics, RuntimeHandles, RuntimeResources, WorkflowInstance, WorktreeRealized,
};
pub use spec::{WorkflowSpec, WorktreeRequest};
pub use state::WorkflowState;

pub type Result<T> = std::result::Result<T, ControlPlaneError>;
