//! Engine settings, read from `~/.campaigns/config.yaml`.
//!
//! Every key is optional; a missing file means all defaults.
//!
//! ```yaml
//! workers: 4
//! max_retries: 60
//! poll_interval_ms: 1000
//! recompute_interval_secs: 120
//! priority_capacity: 500
//! sleep_before_sync_ms: 3000
//! flush_interval_secs: 5
//! log_format: json
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use campaigns_reconciler::executor::{DEFAULT_MAX_RETRIES, DEFAULT_SLEEP_BEFORE_SYNC};
use campaigns_reconciler::ReconcilerConfig;

use crate::error::{io_err, DaemonError};
use crate::paths::config_path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of reconciler worker tasks.
    pub workers: usize,
    /// Failures after which a changeset is no longer retried.
    pub max_retries: u32,
    /// How often an idle worker looks for queued changesets.
    pub poll_interval_ms: u64,
    /// How often the sync schedule is rebuilt from the store.
    pub recompute_interval_secs: u64,
    /// Bound of the priority sync queue; requests beyond it are dropped.
    pub priority_capacity: usize,
    pub sleep_before_sync_ms: u64,
    /// How often committed store state is written to disk.
    pub flush_interval_secs: u64,
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: DEFAULT_MAX_RETRIES,
            poll_interval_ms: 1000,
            recompute_interval_secs: 120,
            priority_capacity: 500,
            sleep_before_sync_ms: DEFAULT_SLEEP_BEFORE_SYNC.as_millis() as u64,
            flush_interval_secs: 5,
            log_format: LogFormat::Text,
        }
    }
}

impl EngineConfig {
    pub fn load_at(home: &Path) -> Result<Self, DaemonError> {
        let path = config_path(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Self::parse(&contents, &path)
    }

    pub fn parse(contents: &str, origin: &Path) -> Result<Self, DaemonError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(contents).map_err(|source| DaemonError::Config {
            path: origin.to_path_buf(),
            source,
        })?;
        if config.workers == 0 {
            return Err(DaemonError::Protocol(format!(
                "{}: workers must be at least 1",
                origin.display()
            )));
        }
        Ok(config)
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            max_retries: self.max_retries,
            sleep_before_sync: Duration::from_millis(self.sleep_before_sync_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn recompute_interval(&self) -> Duration {
        Duration::from_secs(self.recompute_interval_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().expect("home");
        let config = EngineConfig::load_at(home.path()).expect("load");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.reconciler_config().max_retries, 60);
    }

    #[test]
    fn partial_file_overrides_named_keys() {
        let config = EngineConfig::parse(
            "workers: 2\nlog_format: json\nsleep_before_sync_ms: 0\n",
            &PathBuf::from("config.yaml"),
        )
        .expect("parse");
        assert_eq!(config.workers, 2);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.reconciler_config().sleep_before_sync.is_zero());
        assert_eq!(config.priority_capacity, 500);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineConfig::parse("wrokers: 2\n", &PathBuf::from("config.yaml"))
            .expect_err("typo");
        assert!(matches!(err, DaemonError::Config { .. }), "{err}");
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = EngineConfig::parse("workers: 0\n", &PathBuf::from("config.yaml"))
            .expect_err("zero workers");
        assert!(err.to_string().contains("workers"));
    }
}
