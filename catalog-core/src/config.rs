//! src/config.rs
//! ============================================================================
//! # Config: Catalog Configuration Loader and Saver
//!
//! User-editable settings for the catalog engine, stored as TOML in the
//! platform config directory found through [`directories`].
//!
//! ## Example
//! ```rust,ignore
//! let config = Config::load().await?;
//! config.save().await?;
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use tokio::fs as TokioFs;

use crate::logging::LoggerConfig;

/// Delayed purge of decoded resources after a container is deselected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeConfig {
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadingConfig {
    /// Quiet period before a filter edit reloads the selected container
    #[serde(with = "humantime_serde")]
    pub filter_debounce: Duration,

    /// Quiet period before a burst of state changes is written out
    #[serde(with = "humantime_serde")]
    pub state_save_debounce: Duration,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            filter_debounce: Duration::from_millis(250),
            state_save_debounce: Duration::from_millis(100),
        }
    }
}

/// Polling schedule for renditions that must be generated server side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    pub factor: u32,

    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 2,
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderConfig {
    /// Top-level folders offered by the folder source
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    #[serde(default)]
    pub show_hidden: bool,

    #[serde(default)]
    pub watch: FolderWatchConfig,
}

/// Reloading of loaded folders when their contents change on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderWatchConfig {
    pub enabled: bool,

    /// How often a watched folder is rescanned
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Quiet period before a burst of changes triggers one reload
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for FolderWatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(2),
            debounce: Duration::from_millis(500),
        }
    }
}

/// Main configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Where the expanded/selected tree state lives. Defaults next to the config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,

    #[serde(default)]
    pub purge: PurgeConfig,

    #[serde(default)]
    pub loading: LoadingConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub folders: FolderConfig,

    #[serde(default)]
    pub logging: LoggerConfig,
}

impl Config {
    /// Loads config from the app config dir, writing defaults on first run.
    pub async fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            info!("Loading config from {}", path.display());
            let text = TokioFs::read_to_string(&path).await?;
            let cfg: Self = toml::from_str(&text)?;

            Ok(cfg)
        } else {
            info!(
                "No config file found at {}, using default configuration. Creating it now.",
                path.display()
            );

            let default_config = Self::default();
            default_config.save().await?;

            Ok(default_config)
        }
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;

        info!("Saving config to {}", path.display());

        if let Some(parent) = path.parent() {
            TokioFs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        TokioFs::write(&path, toml_str).await?;

        Ok(())
    }

    /// Returns the canonical config file path using `directories::ProjectDirs`.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let proj = ProjectDirs::from("org", "example", "MediaCatalog")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        Ok(proj.config_dir().to_path_buf())
    }

    /// Resolved location of the persisted tree state.
    pub fn state_path(&self) -> anyhow::Result<PathBuf> {
        match &self.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("state.json")),
        }
    }
}
