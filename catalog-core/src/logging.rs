//! `src/logging.rs`
//! ============================================================================
//! # Logging: JSON-lines tracing subscriber
//!
//! Installs a `tracing-subscriber` registry that writes one JSON object per
//! event into a rolling file under the configured log directory. The writer
//! is non-blocking; keep the returned [`WorkerGuard`] alive for the lifetime
//! of the process so buffered lines are flushed on exit.

use std::{path::PathBuf, str::FromStr};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use tokio::fs as TokioFs;
use tracing::info;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Layer, filter::Directive, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub log_dir: PathBuf,
    pub log_file_prefix: CompactString,
    pub log_level: CompactString,
    pub max_log_files: usize,
    pub rotation: LogRotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Never,
    Hourly,
    Daily,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: CompactString::const_new("catalog"),
            log_level: CompactString::const_new("info"),
            max_log_files: 10,
            rotation: LogRotation::Daily,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Logger already initialized")]
    AlreadyInitialized,

    #[error("Invalid log directory: {0}")]
    InvalidLogDirectory(String),

    #[error("Failed to create log directory: {0}")]
    DirectoryCreationFailed(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

fn validate_config(config: &LoggerConfig) -> Result<(), LoggingError> {
    if config.log_dir.as_os_str().is_empty() {
        return Err(LoggingError::InvalidLogDirectory(
            "log directory must not be empty".into(),
        ));
    }

    if config.log_file_prefix.is_empty() {
        return Err(LoggingError::ConfigError("log file prefix must not be empty".into()));
    }

    if config.max_log_files == 0 {
        return Err(LoggingError::ConfigError("max_log_files must be at least 1".into()));
    }

    Directive::from_str(&config.log_level)
        .map_err(|e| LoggingError::ConfigError(format!("invalid log level: {e}")))?;

    Ok(())
}

/// Fluent setup for the global subscriber.
#[derive(Debug, Default)]
pub struct LoggerBuilder {
    config: LoggerConfig,
}

impl LoggerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: LoggerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.config.log_level = level.into();
        self
    }

    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    /// Install the subscriber. Fails if one is already set.
    pub async fn build(self) -> Result<WorkerGuard, LoggingError> {
        let config = self.config;
        validate_config(&config)?;
        TokioFs::create_dir_all(&config.log_dir).await?;

        let rotation = match config.rotation {
            LogRotation::Never => Rotation::NEVER,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
        };

        let file_appender = RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(config.log_file_prefix.as_str())
            .filename_suffix("jsonl")
            .max_log_files(config.max_log_files)
            .build(&config.log_dir)
            .map_err(|e| LoggingError::InvalidLogDirectory(e.to_string()))?;

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let level = Directive::from_str(&config.log_level)
            .map_err(|e| LoggingError::ConfigError(e.to_string()))?;
        let filter = EnvFilter::from_default_env().add_directive(level);

        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(filter);

        tracing_subscriber::registry()
            .with(json_layer)
            .try_init()
            .map_err(|_| LoggingError::AlreadyInitialized)?;

        info!(
            marker = "LOGGING_INITIALIZED",
            operation_type = "logging",
            log_dir = %config.log_dir.display(),
            level = %config.log_level,
            "Logging initialized"
        );

        Ok(guard)
    }
}

pub async fn init_logging_with_config(config: LoggerConfig) -> Result<WorkerGuard, LoggingError> {
    LoggerBuilder::new().with_config(config).build().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&LoggerConfig::default()).is_ok());
    }

    #[test]
    fn rejects_unusable_settings() {
        let empty_prefix = LoggerConfig {
            log_file_prefix: CompactString::default(),
            ..LoggerConfig::default()
        };
        assert!(matches!(
            validate_config(&empty_prefix),
            Err(LoggingError::ConfigError(_))
        ));

        let no_files = LoggerConfig {
            max_log_files: 0,
            ..LoggerConfig::default()
        };
        assert!(validate_config(&no_files).is_err());

        let no_dir = LoggerConfig {
            log_dir: PathBuf::new(),
            ..LoggerConfig::default()
        };
        assert!(matches!(
            validate_config(&no_dir),
            Err(LoggingError::InvalidLogDirectory(_))
        ));
    }

    #[test]
    fn builder_overrides_level_and_directory() {
        let builder = LoggerBuilder::new()
            .with_level("debug")
            .with_log_dir("/tmp/catalog-logs");
        assert_eq!(builder.config.log_level, "debug");
        assert_eq!(builder.config.log_dir, PathBuf::from("/tmp/catalog-logs"));
    }
}
