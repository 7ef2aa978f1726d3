//! Configuration management (TOML)

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const MIN_POLLING_PERIOD_SECS: u64 = 10;
pub const MIN_SAVE_INTERVAL_SECS: u64 = 60;
/// `save_interval_secs` value that turns the flush timer off.
pub const PERSISTENCE_DISABLED: u64 = 0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub important: ImportantConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub process_name: String,
    pub launch_command: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    pub visible: bool,
    pub autostart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub polling_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub save_interval_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportantConfig {
    pub process_names: Vec<String>,
    pub check_interval_secs: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            process_name: "cgminer".to_string(),
            launch_command: PathBuf::new(),
            api_host: "127.0.0.1".to_string(),
            api_port: 4028,
            visible: false,
            autostart: true,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig { polling_period_secs: MIN_POLLING_PERIOD_SECS }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig { save_interval_secs: 300, data_dir: None }
    }
}

impl Default for ImportantConfig {
    fn default() -> Self {
        ImportantConfig { process_names: vec![], check_interval_secs: 1 }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Write { path: parent.to_path_buf(), source })?;
        }
        fs::write(path, content)
            .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
    }

    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "minerguard")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Clamp values below their minimums. Returns a note per adjustment.
    pub fn validated(mut self) -> (Self, Vec<String>) {
        let mut notes = Vec::new();
        if self.watchdog.polling_period_secs < MIN_POLLING_PERIOD_SECS {
            notes.push(format!(
                "Setting polling_period_secs to minimum polling period [{}s].",
                MIN_POLLING_PERIOD_SECS
            ));
            self.watchdog.polling_period_secs = MIN_POLLING_PERIOD_SECS;
        }
        let save = self.telemetry.save_interval_secs;
        if save != PERSISTENCE_DISABLED && save < MIN_SAVE_INTERVAL_SECS {
            notes.push(format!(
                "Setting save_interval_secs to minimum save interval [{}s].",
                MIN_SAVE_INTERVAL_SECS
            ));
            self.telemetry.save_interval_secs = MIN_SAVE_INTERVAL_SECS;
        }
        if self.important.check_interval_secs == 0 {
            self.important.check_interval_secs = 1;
        }
        (self, notes)
    }

    pub fn polling_period(&self) -> Duration {
        Duration::from_secs(self.watchdog.polling_period_secs)
    }

    /// `None` when persistence is disabled.
    pub fn save_interval(&self) -> Option<Duration> {
        match self.telemetry.save_interval_secs {
            PERSISTENCE_DISABLED => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Defaults to `GraphData/datastore.db` next to the executable.
    pub fn store_path(&self) -> PathBuf {
        let dir = self.telemetry.data_dir.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."))
                .join("GraphData")
        });
        dir.join("datastore.db")
    }
}
