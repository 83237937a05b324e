//! Runner configuration
//!
//! Every field carries a default so an absent or partial TOML file is valid.
//! The runner binary applies CLI overrides on top of the loaded values.

use crate::error::{CommonError, Result};
use crate::MIB;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for the conversion host runner
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RunnerConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CommonError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

// ── Sync ──────────────────────────────────────────────────────────────────────

/// Incremental sync tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds to wait between rounds while no cutover is requested
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Maximum reads in flight against one transport session
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Maximum size of a single read request
    #[serde(default = "default_max_read_len")]
    pub max_read_len: u32,
    /// Extents shorter than this are copied without a block-status query
    #[serde(default = "default_status_bypass_len")]
    pub status_bypass_len: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_max_in_flight() -> usize {
    2
}

fn default_max_read_len() -> u32 {
    23 << 20
}

fn default_status_bypass_len() -> u64 {
    MIB
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_in_flight: default_max_in_flight(),
            max_read_len: default_max_read_len(),
            status_bypass_len: default_status_bypass_len(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ── Polling ───────────────────────────────────────────────────────────────────

/// A bounded polling budget: `attempts` probes spaced `delay_secs` apart
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBudget {
    pub attempts: u32,
    pub delay_secs: u64,
}

impl PollBudget {
    pub fn new(attempts: u32, delay_secs: u64) -> Self {
        Self {
            attempts,
            delay_secs,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Budgets for waiting on external resources
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Destination disk becoming ready after creation
    #[serde(default = "default_provision_budget")]
    pub provision: PollBudget,
    /// Attachment deactivating after detach
    #[serde(default = "default_detach_budget")]
    pub detach: PollBudget,
    /// Disk-exposure socket appearing after the server starts
    #[serde(default = "default_socket_budget")]
    pub socket: PollBudget,
}

fn default_provision_budget() -> PollBudget {
    PollBudget::new(60, 15)
}

fn default_detach_budget() -> PollBudget {
    PollBudget::new(120, 5)
}

fn default_socket_budget() -> PollBudget {
    PollBudget::new(10, 1)
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            provision: default_provision_budget(),
            detach: default_detach_budget(),
            socket: default_socket_budget(),
        }
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Per-VM work directories are created below this root
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Per-VM log directories are created below this root
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,
}

fn default_work_root() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_log_root() -> PathBuf {
    PathBuf::from("/var/log/conversion-host")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            log_root: default_log_root(),
        }
    }
}

// ── Conversion ────────────────────────────────────────────────────────────────

/// External in-place converter invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments; `{descriptor}` is replaced with the descriptor path
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Extra environment for the converter process
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,
}

fn default_program() -> String {
    "virt-v2v".to_string()
}

fn default_args() -> Vec<String> {
    ["--verbose", "-i", "libvirtxml", "{descriptor}", "--in-place"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([("LIBGUESTFS_BACKEND".to_string(), "direct".to_string())])
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            env: default_env(),
        }
    }
}

/// Behaviour switches
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Drop snapshots the source VM already carries before inspection
    #[serde(default)]
    pub remove_existing_snapshots: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RunnerConfig::from_toml("").unwrap();
        assert_eq!(config, RunnerConfig::default());
        assert_eq!(config.sync.interval(), Duration::from_secs(60));
        assert_eq!(config.sync.max_in_flight, 2);
        assert_eq!(config.sync.max_read_len, 23 * 1024 * 1024);
        assert_eq!(config.polling.provision, PollBudget::new(60, 15));
        assert_eq!(config.polling.detach, PollBudget::new(120, 5));
        assert_eq!(config.conversion.program, "virt-v2v");
        assert_eq!(config.conversion.env["LIBGUESTFS_BACKEND"], "direct");
        assert!(!config.policy.remove_existing_snapshots);
    }

    #[test]
    fn test_partial_sections() {
        let config = RunnerConfig::from_toml(
            r#"
            [sync]
            interval_secs = 5

            [polling.detach]
            attempts = 3
            delay_secs = 1

            [policy]
            remove_existing_snapshots = true
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.interval_secs, 5);
        assert_eq!(config.sync.max_in_flight, 2);
        assert_eq!(config.polling.detach, PollBudget::new(3, 1));
        assert_eq!(config.polling.provision, PollBudget::new(60, 15));
        assert!(config.policy.remove_existing_snapshots);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunnerConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, CommonError::Read { .. }));
    }

    #[test]
    fn test_malformed_toml() {
        let err = RunnerConfig::from_toml("[sync]\ninterval_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, CommonError::Config(_)));
    }
}
