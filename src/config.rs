//! Configuration types for the automation daemon.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Database filename within the data directory.
pub const DB_FILENAME: &str = "personal-automator.db";

/// Lock filename guarding single-writer access to the data directory.
pub const LOCK_FILENAME: &str = "personal-automator.lock";

/// Top-level configuration for the automation daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomatorConfig {
    /// Data directory holding the database and master-key fallback file.
    /// `None` resolves to the per-user application data directory.
    pub data_dir: Option<PathBuf>,
    /// HTTP control-plane listen port.
    pub http_port: u16,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Executor settings.
    pub executor: ExecutorConfig,
}

impl Default for AutomatorConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            http_port: 3000,
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrent executions across all tasks.
    pub max_concurrent: usize,
    /// Grace period waited for in-flight executions on `stop()` (seconds).
    pub stop_grace_secs: u64,
    /// Execution rows older than this many days are pruned.
    pub retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            stop_grace_secs: 30,
            retention_days: 30,
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Default script timeout in milliseconds.
    pub default_timeout_ms: u64,
    /// Hard upper bound for any requested timeout (milliseconds).
    pub max_timeout_ms: u64,
    /// Aggregate console output budget per execution (bytes).
    pub max_output_bytes: usize,
    /// Path to the script runtime binary (`None` = discover `node` on PATH).
    pub runtime_path: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5 * 60 * 1000,
            max_timeout_ms: 30 * 60 * 1000,
            max_output_bytes: 1024 * 1024,
            runtime_path: None,
        }
    }
}

impl AutomatorConfig {
    /// Build a configuration from defaults plus environment overrides.
    ///
    /// Honours `PORT` (HTTP listen port) and `AUTOMATOR_DATA_DIR` (data
    /// directory override). Invalid values fall back to defaults with a
    /// warning rather than failing startup.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(p) => config.http_port = p,
                Err(_) => {
                    tracing::warn!(value = %port, "ignoring unparseable PORT");
                }
            }
        }

        if let Some(dir) = std::env::var_os("AUTOMATOR_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        config
    }

    /// Resolve the effective data directory.
    ///
    /// Uses the configured override when present, otherwise the per-user
    /// application data directory (`~/.local/share/personal-automator` on
    /// Linux). Falls back to the current directory when the platform
    /// reports no data dir at all.
    #[must_use]
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("personal-automator"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Full path of the SQLite database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.resolve_data_dir().join(DB_FILENAME)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AutomatorConfig::default();
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(config.scheduler.stop_grace_secs, 30);
        assert_eq!(config.executor.default_timeout_ms, 300_000);
        assert_eq!(config.executor.max_timeout_ms, 1_800_000);
        assert_eq!(config.executor.max_output_bytes, 1_048_576);
    }

    #[test]
    fn explicit_data_dir_wins() {
        let config = AutomatorConfig {
            data_dir: Some(PathBuf::from("/tmp/automator-test")),
            ..AutomatorConfig::default()
        };
        assert_eq!(
            config.db_path(),
            PathBuf::from("/tmp/automator-test").join(DB_FILENAME)
        );
    }

    #[test]
    fn config_serde_round_trip() {
        let config = AutomatorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: AutomatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.http_port, config.http_port);
        assert_eq!(
            restored.scheduler.retention_days,
            config.scheduler.retention_days
        );
    }
}
