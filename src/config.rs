//! Experiment configuration files and logging setup
//!
//! An experiment file names one scheme from the registry plus trainer and
//! logging settings. JSON, YAML and TOML are accepted; the format is picked
//! from the file extension.

use crate::schemes::SchemeConfig;
use crate::training::TrainerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// One training run: the scheme, the outer loop and logging
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub scheme: SchemeConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheme
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        self.trainer
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Serialize in the format implied by the extension of `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = match Format::of(path)? {
            Format::Json => serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?,
            Format::Yaml => serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))?,
            Format::Toml => toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
    Toml,
}

impl Format {
    fn of(path: &Path) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "json" => Ok(Format::Json),
            "yaml" | "yml" => Ok(Format::Yaml),
            "toml" => Ok(Format::Toml),
            other => Err(ConfigError::Parse(format!(
                "unsupported config extension '{}' for {}",
                other,
                path.display()
            ))),
        }
    }
}

/// Load and validate an experiment file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ExperimentConfig, ConfigError> {
    let path = path.as_ref();
    let format = Format::of(path)?;
    let content = std::fs::read_to_string(path)?;
    let config: ExperimentConfig = match format {
        Format::Json => serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?,
        Format::Yaml => serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?,
        Format::Toml => toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?,
    };
    config.validate()?;
    Ok(config)
}

/// Install a global `tracing` subscriber. A second call is a no-op.
pub fn init_logging(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if settings.json {
        registry.with(fmt::layer().json().with_target(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}
