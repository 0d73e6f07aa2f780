//! Runtime configuration loaded from `~/.visitlog/visitlog.toml`.
//!
//! A missing file yields defaults. A file that exists but does not parse is
//! `ConfigMalformed`; callers decide whether to fall back.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, VisitError};
use crate::identity::PractitionerCredential;
use crate::types::CategorySuggestion;

pub const CONFIG_ENV: &str = "VISITLOG_CONFIG";
const VISITLOG_DIR: &str = ".visitlog";
const CONFIG_FILE: &str = "visitlog.toml";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OutboxConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// Seconds between stale-session sweeps; `0` disables the sweeper.
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VisitlogConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub practitioners: Vec<PractitionerCredential>,
    #[serde(default)]
    pub categories: Vec<CategorySuggestion>,
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

impl VisitlogConfig {
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(visitlog_dir()?.join("daemon").join("visitlog.db")),
        }
    }

    pub fn outbox_path(&self) -> Result<PathBuf> {
        match &self.outbox.path {
            Some(path) => Ok(path.clone()),
            None => Ok(visitlog_dir()?.join("outbox.jsonl")),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        match self.sweep.interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Returns `~/.visitlog`.
pub fn visitlog_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| VisitError::Io {
        context: "locating home directory".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "home directory not found"),
    })?;
    Ok(home.join(VISITLOG_DIR))
}

/// `$VISITLOG_CONFIG` if set, otherwise `~/.visitlog/visitlog.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    Ok(visitlog_dir()?.join(CONFIG_FILE))
}

pub fn load_config(path: Option<PathBuf>) -> Result<VisitlogConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(VisitlogConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| VisitError::Io {
        context: format!("reading config {}", config_path.display()),
        source,
    })?;
    toml::from_str::<VisitlogConfig>(&content).map_err(|err| VisitError::ConfigMalformed {
        path: config_path.clone(),
        details: err.to_string(),
    })
}
