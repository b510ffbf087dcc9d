use chrono::Duration;
use cp_core::{ControlPlaneError, Result};

/// Thresholds and enable flags driving stuck detection and recovery
/// escalation.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub heartbeat_timeout: Duration,
    pub progress_timeout: Duration,
    pub max_recoveries: u32,
    pub max_nudges: u32,
    pub recovery_backoff: Duration,
    pub enable_auto_nudge: bool,
    pub enable_auto_replace: bool,
    pub enable_auto_pause: bool,
    pub check_interval: std::time::Duration,
}

impl HealthPolicy {
    /// `MaxRecoveries` must be ≥ `MaxNudges + 2` for the full escalation
    /// sequence (Nudge.. Replace, Pause, Fail) to run to completion.
    /// Validated here rather than left implicit.
    pub fn validate(&self) -> Result<()> {
        if self.max_recoveries < self.max_nudges + 2 {
            return Err(ControlPlaneError::InvalidRecoveryAction {
                reason: format!(
                    "max_recoveries ({}) must be at least max_nudges + 2 ({})",
                    self.max_recoveries,
                    self.max_nudges + 2
                ),
            });
        }
        Ok(())
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::seconds(60),
            progress_timeout: Duration::seconds(300),
            max_recoveries: 4,
            max_nudges: 2,
            recovery_backoff: Duration::seconds(30),
            enable_auto_nudge: true,
            enable_auto_replace: true,
            enable_auto_pause: true,
            check_interval: std::time::Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_max_recoveries_too_low() {
        let policy = HealthPolicy {
            max_nudges: 2,
            max_recoveries: 2,
            ..HealthPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn accepts_exact_minimum() {
        let policy = HealthPolicy {
            max_nudges: 2,
            max_recoveries: 4,
            ..HealthPolicy::default()
        };
        assert!(policy.validate().is_ok());
    }
}
