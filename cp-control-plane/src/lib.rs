//! Top-level orchestration facade: wires the durable registry, the
//! supervisor, the event bus, and the health monitor into the single
//! entry point `cp-daemon` talks to.

pub mod bridge;
pub mod facade;

pub use bridge::{FacadeRecoveryTarget, RegistryActiveWorkersSink, RegistryContextProvider};
pub use facade::{build_registry, ControlPlane};
