//! Configuration Storage
//!
//! Handles reading/writing the transfer configuration file.
//! Config location: ~/.oxideterm on macOS/Linux, %APPDATA%\OxideTerm on Windows

use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{TransferConfig, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Get the OxideTerm configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTerm"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the transfer config file path
pub fn transfer_config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("transfer.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: transfer_config_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load configuration from disk
    /// Returns default config if file doesn't exist
    /// If config is corrupted, creates a backup and returns default config
    pub async fn load(&self) -> Result<TransferConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<TransferConfig>(&contents) {
                Ok(config) => {
                    if config.version > CONFIG_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: config.version,
                            supported: CONFIG_VERSION,
                        });
                    }
                    config.validate()?;
                    Ok(config)
                }
                Err(e) => {
                    tracing::warn!("Config file corrupted: {}", e);

                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted config backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted config: {}", backup_err);
                        }
                    }

                    Ok(TransferConfig::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TransferConfig::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save configuration to disk
    pub async fn save(&self, config: &TransferConfig) -> Result<(), StorageError> {
        config.validate()?;
        self.ensure_dir().await?;

        // Write to temp file first, then rename
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Copy the current config aside with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}
