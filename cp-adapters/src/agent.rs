use serde::{Deserialize, Serialize};
use std::fmt;

/// Process role an [`AgentProvider`] is configured for ("only the
/// coordinator role is required"). Mirrors the roles a raw `ProcessEvent`
/// can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Observer,
    Worker,
}

/// Capabilities a given provider exposes for a role: a client handle and
/// the set of tool/extension names it registers. `cp-supervisor` only ever
/// asks for these two things when spawning a process for a role.
pub trait AgentProvider: Send + Sync + fmt::Debug {
    fn role(&self) -> Role;
    fn client_name(&self) -> &str;
    fn extensions(&self) -> &[String];
}

#[derive(Debug, Clone)]
pub struct StaticAgentProvider {
    role: Role,
    client_name: String,
    extensions: Vec<String>,
}

impl StaticAgentProvider {
    pub fn new(role: Role, client_name: impl Into<String>, extensions: Vec<String>) -> Self {
        Self {
            role,
            client_name: client_name.into(),
            extensions,
        }
    }
}

impl AgentProvider for StaticAgentProvider {
    fn role(&self) -> Role {
        self.role
    }

    fn client_name(&self) -> &str {
        &self.client_name
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }
}
