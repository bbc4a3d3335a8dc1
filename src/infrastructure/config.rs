//! Configuration management.
//!
//! Hierarchical configuration using figment: programmatic defaults,
//! project YAML (`.gathering/config.yaml`, plus an optional
//! `.gathering/local.yaml` override), then `GATHERING_*` environment
//! variables on top. Validation runs after extraction.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_concurrent_runners: {0}. Must be between 1 and 128")]
    InvalidMaxRunners(usize),

    #[error("Invalid tick_interval_secs: {0}. Must be at least 1")]
    InvalidTickInterval(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid max_iterations: {0}. Cannot be 0")]
    InvalidMaxIterations(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite file, relative to the working directory.
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: ".gathering/gathering.db".to_string(), max_connections: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircleSettings {
    pub require_review: bool,
    pub auto_route: bool,
    pub max_iterations: u32,
    pub max_workload: u32,
    pub stop_grace_secs: u64,
}

impl Default for CircleSettings {
    fn default() -> Self {
        Self {
            require_review: true,
            auto_route: true,
            max_iterations: 3,
            max_workload: 5,
            stop_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSettingsConfig {
    pub turn_timeout_secs: u64,
    pub transcript_tail: usize,
}

impl Default for ConversationSettingsConfig {
    fn default() -> Self {
        Self { turn_timeout_secs: 60, transcript_tail: 12 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    pub max_concurrent_runners: usize,
    pub step_backoff_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self { max_concurrent_runners: 8, step_backoff_ms: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub tick_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { tick_interval_secs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// When set, logs also go to a daily-rotated file in this directory.
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string(), log_dir: None }
    }
}

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub database: DatabaseConfig,
    pub circle: CircleSettings,
    pub conversation: ConversationSettingsConfig,
    pub executor: ExecutorSettings,
    pub scheduler: SchedulerSettings,
    pub logging: LoggingConfig,
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Precedence (lowest to highest): defaults, project config, local
    /// overrides, environment.
    pub fn load() -> Result<CoreConfig> {
        let config: CoreConfig = Figment::new()
            .merge(Serialized::defaults(CoreConfig::default()))
            .merge(Yaml::file(".gathering/config.yaml"))
            .merge(Yaml::file(".gathering/local.yaml"))
            .merge(Env::prefixed("GATHERING_").split("__"))
            .extract()
            .context("Failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<CoreConfig> {
        let config: CoreConfig = Figment::new()
            .merge(Serialized::defaults(CoreConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &CoreConfig) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.executor.max_concurrent_runners == 0
            || config.executor.max_concurrent_runners > 128
        {
            return Err(ConfigError::InvalidMaxRunners(config.executor.max_concurrent_runners));
        }
        if config.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidTickInterval(config.scheduler.tick_interval_secs));
        }
        if config.circle.max_iterations == 0 {
            return Err(ConfigError::InvalidMaxIterations(config.circle.max_iterations));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = CoreConfig::default();
        assert!(ConfigLoader::validate(&config).is_ok());
        assert_eq!(config.executor.max_concurrent_runners, 8);
        assert_eq!(config.scheduler.tick_interval_secs, 5);
        assert!(config.circle.require_review);
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut config = CoreConfig::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));

        let mut config = CoreConfig::default();
        config.executor.max_concurrent_runners = 0;
        assert!(ConfigLoader::validate(&config).is_err());

        let mut config = CoreConfig::default();
        config.database.path = String::new();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::EmptyDatabasePath)
        ));
    }
}
