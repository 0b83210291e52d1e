//! Configuration Management Module
//!
//! Transfer tunables and their persistent storage.

pub mod storage;

use serde::{Deserialize, Serialize};

use crate::sftp::types::constants::{
    DEFAULT_IO_TIMEOUT_SECS, DEFAULT_MAX_DEPTH, DEFAULT_TEMP_SUFFIX,
};

pub use storage::{config_dir, transfer_config_file, ConfigStorage, StorageError};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Transfer tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Config file version
    pub version: u32,

    /// Appended to the destination path of an upload while it is in flight
    pub temp_suffix: String,

    /// Deepest directory level a tree transfer descends to
    pub max_depth: usize,

    /// Per-request I/O timeout in seconds
    pub io_timeout_secs: u64,

    /// Apply remote directory permissions to downloaded directories (Unix only)
    pub preserve_directory_mode: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            temp_suffix: DEFAULT_TEMP_SUFFIX.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
            io_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            preserve_directory_mode: true,
        }
    }
}

impl TransferConfig {
    /// Reject values that would make uploads unsafe or transfers impossible
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.temp_suffix.is_empty() || self.temp_suffix.contains('/') {
            return Err(StorageError::Invalid(format!(
                "temp_suffix {:?} must be non-empty and contain no '/'",
                self.temp_suffix
            )));
        }
        if self.io_timeout_secs == 0 {
            return Err(StorageError::Invalid(
                "io_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.temp_suffix, ".tabby-upload");
        assert_eq!(config.max_depth, 64);
        assert_eq!(config.io_timeout_secs, 300);
        assert!(config.preserve_directory_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: TransferConfig = serde_json::from_str(r#"{"max_depth": 8}"#).unwrap();
        assert_eq!(config.max_depth, 8);
        assert_eq!(config.temp_suffix, ".tabby-upload");
    }

    #[test]
    fn test_validate_rejects_bad_suffix() {
        let config = TransferConfig {
            temp_suffix: "/tmp".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = TransferConfig {
            temp_suffix: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
