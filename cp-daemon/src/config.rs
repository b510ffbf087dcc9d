use std::path::PathBuf;
use std::time::Duration;

use cp_health::HealthPolicy;
use serde::Deserialize;

/// Typed configuration loaded once at startup: a TOML file overlaid with
/// environment variables.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub bind_addr: String,
    pub sqlite_path: PathBuf,
    pub project: String,
    pub repo_root: Option<PathBuf>,
    pub health: HealthPolicy,
    pub feature_flags: Vec<String>,
}

/// Raw deserialization target for the TOML file. Every field is optional
/// so a partial or absent config file still loads; `DaemonConfig::load`
/// fills in defaults and then applies environment overrides.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    bind_addr: Option<String>,
    sqlite_path: Option<PathBuf>,
    project: Option<String>,
    repo_root: Option<PathBuf>,
    feature_flags: Option<Vec<String>>,
    health: Option<RawHealthPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHealthPolicy {
    heartbeat_timeout_secs: Option<i64>,
    progress_timeout_secs: Option<i64>,
    max_recoveries: Option<u32>,
    max_nudges: Option<u32>,
    recovery_backoff_secs: Option<i64>,
    check_interval_secs: Option<u64>,
    enable_auto_nudge: Option<bool>,
    enable_auto_replace: Option<bool>,
    enable_auto_pause: Option<bool>,
}

impl DaemonConfig {
    /// Reads `path` if it exists (a missing file is not an error — every
    /// field has a default), then applies `CPD_*` environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let raw: RawConfig = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)?
            }
            _ => RawConfig::default(),
        };

        let default_policy = HealthPolicy::default();
        let raw_health = raw.health.unwrap_or_default();

        let mut config = Self {
            bind_addr: raw.bind_addr.unwrap_or_else(|| "127.0.0.1:4590".to_string()),
            sqlite_path: raw.sqlite_path.unwrap_or_else(|| PathBuf::from("cp-daemon.sqlite3")),
            project: raw.project.unwrap_or_else(|| "default".to_string()),
            repo_root: raw.repo_root,
            feature_flags: raw.feature_flags.unwrap_or_default(),
            health: HealthPolicy {
                heartbeat_timeout: raw_health
                    .heartbeat_timeout_secs
                    .map(chrono::Duration::seconds)
                    .unwrap_or(default_policy.heartbeat_timeout),
                progress_timeout: raw_health
                    .progress_timeout_secs
                    .map(chrono::Duration::seconds)
                    .unwrap_or(default_policy.progress_timeout),
                max_recoveries: raw_health.max_recoveries.unwrap_or(default_policy.max_recoveries),
                max_nudges: raw_health.max_nudges.unwrap_or(default_policy.max_nudges),
                recovery_backoff: raw_health
                    .recovery_backoff_secs
                    .map(chrono::Duration::seconds)
                    .unwrap_or(default_policy.recovery_backoff),
                enable_auto_nudge: raw_health.enable_auto_nudge.unwrap_or(default_policy.enable_auto_nudge),
                enable_auto_replace: raw_health.enable_auto_replace.unwrap_or(default_policy.enable_auto_replace),
                enable_auto_pause: raw_health.enable_auto_pause.unwrap_or(default_policy.enable_auto_pause),
                check_interval: raw_health
                    .check_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default_policy.check_interval),
            },
        };

        config.apply_env_overrides();
        config.health.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CPD_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("CPD_SQLITE_PATH") {
            self.sqlite_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CPD_PROJECT") {
            self.project = v;
        }
        if let Ok(v) = std::env::var("CPD_REPO_ROOT") {
            self.repo_root = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("CPD_MAX_RECOVERIES") {
            if let Ok(n) = v.parse() {
                self.health.max_recoveries = n;
            }
        }
        if let Ok(v) = std::env::var("CPD_MAX_NUDGES") {
            if let Ok(n) = v.parse() {
                self.health.max_nudges = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = DaemonConfig::load(Some(std::path::Path::new("/nonexistent/cpd.toml"))).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:4590");
        assert_eq!(config.project, "default");
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpd.toml");
        std::fs::write(&path, "bind_addr = \"0.0.0.0:9000\"\n").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.project, "default");
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpd.toml");
        std::fs::write(&path, "bind_addr = \"0.0.0.0:9000\"\n").unwrap();

        std::env::set_var("CPD_BIND_ADDR", "127.0.0.1:1");
        let config = DaemonConfig::load(Some(&path)).unwrap();
        std::env::remove_var("CPD_BIND_ADDR");

        assert_eq!(config.bind_addr, "127.0.0.1:1");
    }
}
