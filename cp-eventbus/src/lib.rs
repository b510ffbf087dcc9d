//! Cross-workflow event bus: classifies raw per-workflow process events
//! into tagged `ControlPlaneEvent`s and fans them out to filtered
//! subscribers.

pub mod bus;
pub mod event;

pub use bus::{ActiveWorkersSink, ContextProvider, EventBus, LifecycleCallback};
pub use event::{classify, ControlPlaneEvent, EventFilter, EventType, WorkflowContextSnapshot};
