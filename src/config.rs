use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarvestError, Result};
use crate::extract::ExtractionSettings;
use crate::pipeline::RetryPolicy;

/// Global loanharvest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pause between products when running sequentially (milliseconds)
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,

    /// Products processed in parallel; 1 means sequential with delay
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Whole-request timeout for HTTP fetches (seconds)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Profile table to use instead of the built-in one
    #[serde(default)]
    pub profiles_path: Option<PathBuf>,

    /// Backoff for persistence retries
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Rate exclusion and context keywords
    #[serde(default)]
    pub extraction: ExtractionSettings,
}

fn default_request_delay() -> u64 {
    1000
}

fn default_workers() -> usize {
    1
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("loanharvest/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_delay_ms: default_request_delay(),
            workers: default_workers(),
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
            profiles_path: None,
            retry: RetryPolicy::default(),
            extraction: ExtractionSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.check()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| HarvestError::ConfigError(e.to_string()))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(HarvestError::ConfigError("workers must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(HarvestError::ConfigError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "loanharvest")
            .ok_or_else(|| HarvestError::ConfigError("Could not determine config directory".into()))?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "loanharvest")
            .ok_or_else(|| HarvestError::ConfigError("Could not determine data directory".into()))?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Get the database path
    ///
    /// Supports LOANHARVEST_DB environment variable for test isolation
    pub fn db_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("LOANHARVEST_DB") {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::data_dir()?.join("loanharvest.db"))
    }
}
