//! Project Configuration (keel.toml)
//!
//! Handles project-level configuration stored in `keel.toml` at the project root.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Project configuration from keel.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Native interop settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffi: Option<FfiConfig>,

    /// Logging settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    /// Capability grants for foreign calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityConfig>,
}

/// `[ffi]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FfiConfig {
    /// Extra directories searched for native libraries (highest priority first)
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,

    /// Bindings manifests declaring foreign functions
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<PathBuf>,

    /// Check test overrides against the declared return shape (default: true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_overrides: Option<bool>,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. "keel_runtime=debug"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Output format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<LogFormat>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output
    #[default]
    Compact,
    /// JSON structured output
    Json,
}

/// `[security]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    /// Granted foreign calls: "library", "library::symbol" or "*"
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub foreign: Vec<String>,
}

impl ProjectConfig {
    /// Load project configuration from a file
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

    /// Validate the project configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(ffi) = &self.ffi {
            validate_ffi(ffi)?;
        }
        if let Some(logging) = &self.logging {
            validate_logging(logging)?;
        }
        if let Some(security) = &self.security {
            validate_security(security)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_ffi(ffi: &FfiConfig) -> ConfigResult<()> {
    for manifest in &ffi.manifests {
        if manifest.extension().and_then(|e| e.to_str()) != Some("toml") {
            return Err(ConfigError::InvalidValue {
                field: "ffi.manifests".to_string(),
                reason: format!("'{}' is not a .toml file", manifest.display()),
            });
        }
    }
    if ffi.search_paths.iter().any(|p| p.as_os_str().is_empty()) {
        return Err(ConfigError::InvalidValue {
            field: "ffi.search-paths".to_string(),
            reason: "empty path".to_string(),
        });
    }
    Ok(())
}

pub(crate) fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if let Some(filter) = &logging.filter {
        if filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "logging.filter".to_string(),
                reason: "filter must not be empty".to_string(),
            });
        }
    }
    Ok(())
}

pub(crate) fn validate_security(security: &SecurityConfig) -> ConfigResult<()> {
    for grant in &security.foreign {
        let valid = match grant.split_once("::") {
            Some((library, symbol)) => !library.is_empty() && !symbol.is_empty(),
            None => !grant.is_empty(),
        };
        if !valid {
            return Err(ConfigError::InvalidValue {
                field: "security.foreign".to_string(),
                reason: format!("malformed grant '{}'", grant),
            });
        }
    }
    Ok(())
}
