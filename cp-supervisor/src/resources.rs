use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use cp_adapters::{FabricBroker, FabricLogger, Infrastructure, Session};
use cp_core::RuntimeResources;

use crate::http::HttpServerHandle;

/// Everything `AllocateResources` attaches to a workflow, bundled behind
/// the core's type-erased `RuntimeResources` marker.
#[derive(Debug)]
pub struct SupervisorResources {
    pub infra: Arc<dyn Infrastructure>,
    pub fabric_broker: Arc<dyn FabricBroker>,
    pub fabric_logger: Arc<dyn FabricLogger>,
    pub session: Arc<dyn Session>,
    pub http: parking_lot::Mutex<Option<HttpServerHandle>>,
    pub worktree_path: Option<PathBuf>,
}

impl RuntimeResources for SupervisorResources {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl SupervisorResources {
    /// Downcasts a workflow's opaque runtime resources back to this crate's
    /// concrete type. `None` if the workflow was allocated by some other
    /// supervisor implementation (should not happen in this workspace, but
    /// the core only promises `Any + Send + Sync`).
    pub fn downcast(resources: &Arc<dyn RuntimeResources>) -> Option<&SupervisorResources> {
        resources.as_any().downcast_ref::<SupervisorResources>()
    }
}
