//! Global Configuration (~/.keel/config.toml)
//!
//! Handles user-level configuration stored in `~/.keel/config.toml`.

use crate::project::{validate_ffi, validate_logging, FfiConfig, LoggingConfig};
use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global user configuration from ~/.keel/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Machine-wide native interop settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffi: Option<FfiConfig>,

    /// Logging defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl GlobalConfig {
    /// Load global configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the global configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(ffi) = &self.ffi {
            if !ffi.manifests.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "ffi.manifests".to_string(),
                    reason: "manifests are project-scoped".to_string(),
                });
            }
            validate_ffi(ffi)?;
        }
        if let Some(logging) = &self.logging {
            validate_logging(logging)?;
        }
        Ok(())
    }

    /// Get the global config file path (~/.keel/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".keel").join("config.toml"))
    }

    /// Merge another global config into this one
    /// Other config takes precedence for non-None values
    pub fn merge(&mut self, other: &GlobalConfig) {
        if other.ffi.is_some() {
            self.ffi = other.ffi.clone();
        }
        if other.logging.is_some() {
            self.logging = other.logging.clone();
        }
    }
}
