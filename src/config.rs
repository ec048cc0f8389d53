use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::deadlock::StallThresholds;
use crate::load_manager::LoadManagerSettings;

/// Top-level configuration loaded from loadmgr.toml.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct LoadMgrConfig {
    pub watchdog: WatchdogConfig,
    pub fee: FeeConfig,
    pub queue: QueueConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub period_ms: u64,
    pub report_interval_secs: i64,
    pub fatal_stall_secs: i64,
    /// Startup grace before the host arms the deadlock detector.
    pub arm_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeeConfig {
    pub normal_fee: u64,
    pub max_fee: u64,
    pub increase_fraction: u64,
    pub decrease_fraction: u64,
    /// Consecutive overloaded ticks required before the fee moves up.
    pub raise_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub overload_threshold: u64,
    /// Jobs the host's load source submits each second. 0 disables it.
    pub arrivals_per_sec: u64,
    /// Jobs the load source retires each second.
    pub service_per_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
}

// --- Default implementations ---

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            report_interval_secs: 10,
            fatal_stall_secs: 500,
            arm_after_secs: 5,
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            normal_fee: 256,
            max_fee: 256 * 1_000_000,
            increase_fraction: 4,
            decrease_fraction: 4,
            raise_threshold: 2,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            overload_threshold: 1000,
            arrivals_per_sec: 0,
            service_per_sec: 100,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_secs: 1 }
    }
}

impl From<&WatchdogConfig> for LoadManagerSettings {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            period: Duration::from_millis(config.period_ms),
            thresholds: StallThresholds {
                report_interval_secs: config.report_interval_secs,
                fatal_stall_secs: config.fatal_stall_secs,
            },
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value is out of range.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl LoadMgrConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the load manager cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.watchdog;
        if w.period_ms == 0 {
            return Err(ConfigError::Invalid("watchdog.period_ms must be > 0".into()));
        }
        if w.report_interval_secs <= 0 {
            return Err(ConfigError::Invalid(
                "watchdog.report_interval_secs must be > 0".into(),
            ));
        }
        if w.fatal_stall_secs <= w.report_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "watchdog.fatal_stall_secs ({}) must exceed report_interval_secs ({})",
                w.fatal_stall_secs, w.report_interval_secs
            )));
        }

        let fee = &self.fee;
        if fee.increase_fraction == 0 || fee.decrease_fraction == 0 {
            return Err(ConfigError::Invalid(
                "fee.increase_fraction and fee.decrease_fraction must be > 0".into(),
            ));
        }
        if fee.normal_fee == 0 {
            return Err(ConfigError::Invalid("fee.normal_fee must be > 0".into()));
        }
        if fee.max_fee < fee.normal_fee {
            return Err(ConfigError::Invalid(format!(
                "fee.max_fee ({}) must be >= fee.normal_fee ({})",
                fee.max_fee, fee.normal_fee
            )));
        }

        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}
