//! The only component that touches per-workflow resources: infrastructure,
//! HTTP server, TCP listener, worktree, session directory.
//!
//! `cp-core` and `cp-eventbus` know nothing about any of this — they only
//! see a `WorkflowInstance` with an opaque `RuntimeResources` handle. This
//! crate is where that handle comes from.

pub mod config;
pub mod http;
pub mod resources;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use http::HttpServerHandle;
pub use resources::SupervisorResources;
pub use supervisor::{ShutdownOptions, Supervisor};
