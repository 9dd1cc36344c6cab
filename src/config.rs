use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DATA_DIR_ENV: &str = "AUTOMATA_DATA_DIR";
pub const CONFIG_FILE_NAME: &str = "runtime.toml";
pub const DATABASE_FILE_NAME: &str = "automata.db";

/// Runs of one app that must fail back-to-back before it is auto-paused.
pub const CONSECUTIVE_ERROR_THRESHOLD: usize = 3;
/// How far back the consecutive-error count looks.
pub const ERROR_STREAK_WINDOW: usize = 50;

const DEFAULT_MAX_CONCURRENT_RUNS: usize = 3;
const DEFAULT_ESCALATION_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub max_concurrent_runs: usize,
    pub escalation_timeout_secs: u64,
    pub escalation_sweep_interval_secs: u64,
    pub retention_days: u32,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            escalation_timeout_secs: DEFAULT_ESCALATION_TIMEOUT_SECS,
            escalation_sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
            log_level: "info".to_string(),
        }
    }
}

/// `~/.automata`, or the current directory when no home can be resolved.
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".automata"))
        .unwrap_or_else(|| PathBuf::from(".automata"))
}

impl RuntimeConfig {
    /// Load from the process environment: `AUTOMATA_DATA_DIR` picks the data
    /// directory, `runtime.toml` inside it supplies the rest.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Same as [`RuntimeConfig::load`] with an injectable env lookup.
    pub fn load_with<F>(env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = env(DATA_DIR_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        Self::load_from_dir(&data_dir)
    }

    pub fn load_from_dir(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<RuntimeConfig>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            RuntimeConfig::default()
        };
        // The directory the file was found in wins over whatever it says.
        config.data_dir = data_dir.to_path_buf();
        config.max_concurrent_runs = config.max_concurrent_runs.max(1);
        config.escalation_sweep_interval_secs = config.escalation_sweep_interval_secs.max(1);
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE_NAME)
    }

    pub fn escalation_timeout(&self) -> Duration {
        Duration::from_secs(self.escalation_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.escalation_sweep_interval_secs)
    }

    /// `None` when retention pruning is disabled.
    pub fn retention(&self) -> Option<Duration> {
        if self.retention_days == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60))
        }
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}
