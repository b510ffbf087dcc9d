use chrono::{DateTime, Utc};

/// Per-workflow health tracking.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    pub recovery_count: u32,
    pub last_recovery_at: Option<DateTime<Utc>>,
}

impl HealthStatus {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            is_healthy: true,
            last_heartbeat_at: now,
            last_progress_at: now,
            recovery_count: 0,
            last_recovery_at: None,
        }
    }

    /// Stuck iff `now - LastProgressAt > ProgressTimeout`.
    pub fn is_stuck(&self, now: DateTime<Utc>, progress_timeout: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_progress_at) > progress_timeout
    }

    pub fn backoff_elapsed(&self, now: DateTime<Utc>, backoff: chrono::Duration) -> bool {
        match self.last_recovery_at {
            Some(last) => now.signed_duration_since(last) >= backoff,
            None => true,
        }
    }
}
