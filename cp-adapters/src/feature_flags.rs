use std::collections::HashSet;

/// Flags consumed by the supervisor: `session-resume`,
/// `remove-worktree`, `session-persistence`. Unknown flag names default to
/// disabled rather than erroring, so a config written against a newer
/// version of this crate degrades gracefully against an older one.
#[derive(Debug, Clone, Default)]
pub struct FeatureFlags {
    enabled: HashSet<String>,
}

pub const SESSION_RESUME: &str = "session-resume";
pub const REMOVE_WORKTREE: &str = "remove-worktree";
pub const SESSION_PERSISTENCE: &str = "session-persistence";

impl FeatureFlags {
    pub fn new(enabled: impl IntoIterator<Item = String>) -> Self {
        Self {
            enabled: enabled.into_iter().collect(),
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }

    pub fn session_resume(&self) -> bool {
        self.is_enabled(SESSION_RESUME)
    }

    pub fn remove_worktree(&self) -> bool {
        self.is_enabled(REMOVE_WORKTREE)
    }

    pub fn session_persistence(&self) -> bool {
        self.is_enabled(SESSION_PERSISTENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_flag_defaults_disabled() {
        let flags = FeatureFlags::default();
        assert!(!flags.is_enabled("made-up-flag"));
    }

    #[test]
    fn known_flag_respected() {
        let flags = FeatureFlags::new([SESSION_RESUME.to_string()]);
        assert!(flags.session_resume());
        assert!(!flags.remove_worktree());
    }
}
