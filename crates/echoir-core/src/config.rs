//! Application configuration management.
//!
//! Handles loading, saving, and managing the settings the download subsystem
//! reads: output and cache locations, file naming, quality availability, the
//! queue limit and the catalog client.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::CatalogConfig;
use crate::error::{Error, FileSystemError, Result};
use crate::logging::LoggingConfig;
use crate::naming::FileNamingFormat;
use crate::quality::QualityProfile;
use crate::queue::QueueConfig;
use crate::storage::default_music_directory;

/// Application directory name under the platform config/cache/data roots.
const APP_DIR_NAME: &str = "echoir";

/// Read-only view of the settings the pipeline and planner depend on.
#[cfg_attr(test, mockall::automock)]
pub trait SettingsProvider: Send + Sync {
    /// User-chosen output directory, if any.
    fn output_directory(&self) -> Option<PathBuf>;

    /// How final filenames are composed.
    fn naming_format(&self) -> FileNamingFormat;

    /// Whether a quality tier may be requested.
    fn is_quality_available(&self, quality: QualityProfile) -> bool;

    /// Root for per-job working directories.
    fn cache_directory(&self) -> PathBuf;
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Directory for finished tracks. `None` uses the platform music folder.
    #[serde(default)]
    pub output_directory: Option<PathBuf>,
    /// Directory for in-progress downloads. `None` uses the platform cache.
    #[serde(default)]
    pub cache_directory: Option<PathBuf>,
    /// Download history database. `None` uses the platform data folder.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Final filename format.
    #[serde(default)]
    pub naming_format: FileNamingFormat,
    /// Quality used when a request does not name one.
    #[serde(default)]
    pub default_quality: QualityProfile,
    /// Tiers the account or region cannot access.
    #[serde(default)]
    pub unavailable_qualities: Vec<QualityProfile>,
    /// Download queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Catalog client configuration.
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Console and file logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_directory: None,
            cache_directory: None,
            database_path: None,
            naming_format: FileNamingFormat::default(),
            default_quality: QualityProfile::default(),
            unavailable_qualities: Vec::new(),
            queue: QueueConfig::default(),
            catalog: CatalogConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the platform config file, or create defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from `path`, writing defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found, using defaults");
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(config);
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to read config file: {e}"),
            })
        })?;

        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;
        config.queue.validate();

        info!("Loaded config from {}", path.display());
        debug!(
            output = ?config.output_directory,
            max_concurrent = config.queue.max_concurrent_downloads,
            "Download settings"
        );

        Ok(config)
    }

    /// Save configuration to the platform config file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: format!("Failed to create config directory: {e}"),
                })
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            Error::FileSystem(FileSystemError::WriteFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to write config file: {e}"),
            })
        })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Update the output directory.
    pub fn set_output_directory(&mut self, path: PathBuf) -> Result<()> {
        validate_storage_directory(&path)?;

        info!("Updated output directory to: {}", path.display());
        self.output_directory = Some(path);
        Ok(())
    }

    /// Output directory with the default applied.
    #[must_use]
    pub fn resolved_output_directory(&self) -> PathBuf {
        self.output_directory
            .clone()
            .unwrap_or_else(default_music_directory)
    }

    /// Database path with the default applied.
    #[must_use]
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }

    /// Get the path to the config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

impl SettingsProvider for AppConfig {
    fn output_directory(&self) -> Option<PathBuf> {
        self.output_directory.clone()
    }

    fn naming_format(&self) -> FileNamingFormat {
        self.naming_format
    }

    fn is_quality_available(&self, quality: QualityProfile) -> bool {
        !self.unavailable_qualities.contains(&quality)
    }

    fn cache_directory(&self) -> PathBuf {
        self.cache_directory
            .clone()
            .unwrap_or_else(default_cache_directory)
    }
}

/// Default root for in-progress downloads.
#[must_use]
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

/// Default download history database.
#[must_use]
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join("downloads.sqlite")
}

/// Get the path to the config file.
fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(APP_DIR_NAME)
        .join("config.json")
}

/// Validate that a directory is suitable for storing downloads.
fn validate_storage_directory(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::Configuration(
            "Output directory must be an absolute path".to_string(),
        ));
    }

    if path.exists() {
        if !path.is_dir() {
            return Err(Error::Configuration(format!(
                "Path exists but is not a directory: {}",
                path.display()
            )));
        }

        let test_file = path.join(".echoir_write_test");
        match fs::write(&test_file, "test") {
            Ok(()) => {
                let _ = fs::remove_file(&test_file);
            }
            Err(e) => {
                return Err(Error::Configuration(format!(
                    "Directory is not writable: {} ({})",
                    path.display(),
                    e
                )));
            }
        }
    } else {
        fs::create_dir_all(path).map_err(|e| {
            Error::Configuration(format!("Cannot create directory {}: {}", path.display(), e))
        })?;
    }

    Ok(())
}

/// Configuration manager that owns the live config and persists updates.
///
/// Implements [`SettingsProvider`], so collaborators always read the latest
/// saved settings.
pub struct ConfigManager {
    path: PathBuf,
    config: RwLock<AppConfig>,
}

impl ConfigManager {
    /// Create a config manager backed by the platform config file.
    pub fn new() -> Result<Self> {
        Self::with_path(config_file_path())
    }

    /// Create a config manager backed by `path`.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let config = AppConfig::load_from(&path)?;
        Ok(Self {
            path,
            config: RwLock::new(config),
        })
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration and save it.
    pub fn update(&self, mut config: AppConfig) -> Result<()> {
        if let Some(output) = &config.output_directory {
            validate_storage_directory(output)?;
        }
        config.queue.validate();

        config.save_to(&self.path)?;
        *self.config.write() = config;
        Ok(())
    }

    /// Update just the output directory.
    pub fn set_output_directory(&self, path: PathBuf) -> Result<()> {
        let mut config = self.config();
        config.set_output_directory(path)?;
        config.save_to(&self.path)?;
        *self.config.write() = config;
        Ok(())
    }

    /// Reset to default configuration.
    pub fn reset(&self) -> Result<()> {
        let config = AppConfig::default();
        config.save_to(&self.path)?;
        *self.config.write() = config;
        Ok(())
    }
}

impl SettingsProvider for ConfigManager {
    fn output_directory(&self) -> Option<PathBuf> {
        self.config.read().output_directory()
    }

    fn naming_format(&self) -> FileNamingFormat {
        self.config.read().naming_format
    }

    fn is_quality_available(&self, quality: QualityProfile) -> bool {
        self.config.read().is_quality_available(quality)
    }

    fn cache_directory(&self) -> PathBuf {
        SettingsProvider::cache_directory(&*self.config.read())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
