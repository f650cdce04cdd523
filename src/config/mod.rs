//! Typed configuration.
//!
//! Process-level settings come from environment variables and load once at
//! startup, failing fast if required vars are missing. Tuning for the queue,
//! the processor loop and activities comes from an optional TOML file; every
//! table and key falls back to its default.

pub mod duration;

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::activity::ActivityConfig;
use crate::engine::ProcessorConfig;
use crate::error::{Error, Result};
use crate::queue::QueueConfig;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Path to the TOML tuning file, if any.
    pub settings_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            settings_path: std::env::var("WORKDISPATCH_CONFIG").ok().map(PathBuf::from),
        })
    }

    /// Tuning settings from `settings_path`, or defaults when unset.
    pub fn settings(&self) -> Result<Settings> {
        match self.settings_path {
            Some(ref path) => Settings::load(path),
            None => Ok(Settings::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Queue, processor and activity tuning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub queue: QueueConfig,
    pub processor: ProcessorConfig,
    pub activity: ActivityConfig,
}

impl Settings {
    /// Load a TOML settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}
