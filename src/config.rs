use crate::error::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Engine configuration, persisted as TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Encoder binary; bare name resolves through PATH
    pub ffmpeg_path: String,
    /// Maximum number of simultaneously running encodes
    pub max_concurrent: usize,
    /// Seconds between graceful-termination request and forced kill
    pub grace_period_secs: u64,
    /// Output naming
    pub output: OutputConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            max_concurrent: 2,
            grace_period_secs: 3,
            output: OutputConfig::default(),
        }
    }
}

/// How the CLI derives output paths from inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Suffix appended to the input's file stem
    pub suffix: String,
    /// Output container format
    pub container: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            suffix: "_conv".to_string(),
            container: "mkv".to_string(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from the TOML file, or fall back to defaults
    /// (persisting them for future editing) when it is missing or broken.
    pub fn load() -> Self {
        let config_path = Self::config_path();

        if config_path.exists() {
            match Self::load_from_file(&config_path) {
                Ok(config) => {
                    info!("loaded config from {}", config_path.display());
                    return config;
                }
                Err(e) => {
                    warn!("failed to load config: {e}; using defaults");
                }
            }
        }

        let config = Self::default();
        if let Err(e) = config.save() {
            warn!("failed to save default config: {e}");
        }
        config
    }

    /// Save configuration to the TOML file
    pub fn save(&self) -> QueueResult<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                QueueError::Config(format!("failed to create config directory: {e}"))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| QueueError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(&config_path, toml_string)
            .map_err(|e| QueueError::Config(format!("failed to write config file: {e}")))?;

        info!("saved config to {}", config_path.display());
        Ok(())
    }

    fn load_from_file(path: &PathBuf) -> QueueResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| QueueError::Config(format!("failed to read config file: {e}")))?;
        let config: QueueConfig = toml::from_str(&content)
            .map_err(|e| QueueError::Config(format!("failed to parse config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file location
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ffqueue")
            .join("config.toml")
    }

    /// Check configuration values
    pub fn validate(&self) -> QueueResult<()> {
        if self.ffmpeg_path.is_empty() {
            return Err(QueueError::Config("ffmpeg_path must not be empty".into()));
        }
        if self.max_concurrent == 0 {
            return Err(QueueError::Config(
                "max_concurrent must be at least 1".into(),
            ));
        }
        if self.grace_period_secs == 0 || self.grace_period_secs > 60 {
            return Err(QueueError::Config(
                "grace_period_secs must be between 1 and 60".into(),
            ));
        }
        if self.output.container.is_empty() {
            return Err(QueueError::Config(
                "output.container must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}
