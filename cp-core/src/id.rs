use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque globally unique workflow identifier.
///
/// Stable for the workflow's entire lifetime. Serializes case-preserving
/// (the hyphenated lowercase `Uuid` display form).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Lexicographic ordering string, used as the tie-breaker in stable
    /// listings.
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let id = WorkflowId::new();
        let parsed: WorkflowId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn two_ids_are_unique() {
        assert_ne!(WorkflowId::new(), WorkflowId::new());
    }
}
