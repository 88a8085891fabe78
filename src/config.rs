use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::log::LogLevel;
use crate::{elog_debug, Error, Result};

/// Tunables for dispatch, read from the `[dispatch]` table of `exert.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Attempts for a direct call to a task's remote service.
    pub max_call_attempts: u32,
    /// Per-poll timeout for queue takes, so collectors can see a stop request.
    pub poll_timeout_ms: u64,
    /// Per-take timeout while draining result envelopes after a poison.
    pub drain_timeout_ms: u64,
    pub provision_attempts: u32,
    /// maxBatch for take-matching-any.
    pub collect_batch: usize,
    pub lease_period_ms: u64,
    pub monitor_timeout_ms: u64,
    /// Space workers started by the `exert` binary.
    pub space_workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_call_attempts: 6,
            poll_timeout_ms: 8_000,
            drain_timeout_ms: 200,
            provision_attempts: 3,
            collect_batch: 16,
            lease_period_ms: 60_000,
            monitor_timeout_ms: 30_000,
            space_workers: 4,
        }
    }
}

impl DispatchConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn lease_period(&self) -> Duration {
        Duration::from_millis(self.lease_period_ms)
    }

    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    pub log_level: Option<String>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Config {
    pub fn exert_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".exert"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::exert_dir()?.join("exert.toml"))
    }

    pub fn effective_log_level(&self) -> LogLevel {
        match self.log_level.as_deref().and_then(LogLevel::parse) {
            Some(level) => level,
            None if self.debug => LogLevel::Debug,
            None => LogLevel::Info,
        }
    }

    /// Load `~/.exert/exert.toml`, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        elog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            elog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        elog_debug!(
            "Config loaded: debug={}, attempts={}, poll={}ms",
            config.debug,
            config.dispatch.max_call_attempts,
            config.dispatch.poll_timeout_ms
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        elog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.dispatch.max_call_attempts == 0 {
            return Err(Error::Validation(
                "dispatch.max_call_attempts must be at least 1".to_string(),
            ));
        }
        if self.dispatch.provision_attempts == 0 {
            return Err(Error::Validation(
                "dispatch.provision_attempts must be at least 1".to_string(),
            ));
        }
        if self.dispatch.poll_timeout_ms == 0 {
            return Err(Error::Validation(
                "dispatch.poll_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
