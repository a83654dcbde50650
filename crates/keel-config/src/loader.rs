//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::global::GlobalConfig;
use crate::project::{LogFormat, LoggingConfig, ProjectConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const PROJECT_CONFIG_FILE: &str = "keel.toml";

/// Default `tracing` filter when nothing is configured
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.keel/config.toml) - lowest priority
/// 2. Project config (./keel.toml) - overrides global
/// 3. Environment variables (KEEL_*) - overrides project
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Project configuration
    pub project: ProjectConfig,

    /// Global configuration
    pub global: GlobalConfig,

    /// Project root directory (where keel.toml was found)
    pub project_root: Option<PathBuf>,

    /// Search paths from KEEL_FFI_PATH, searched before everything else
    pub env_search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use an explicit global config file instead of ~/.keel/config.toml
    pub fn with_global_config_path(path: PathBuf) -> Self {
        Self {
            global_config_path: Some(path),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find keel.toml, then loads and merges
    /// global config if it exists.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;
        let global_config = self.load_global_config()?;
        self.finish(project_config, global_config, project_root)
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = ProjectConfig::load_from_file(config_path)?;
        let global_config = self.load_global_config()?;
        let project_root = config_path.parent().map(|p| p.to_path_buf());
        self.finish(project_config, global_config, project_root)
    }

    fn finish(
        &self,
        project: ProjectConfig,
        global: GlobalConfig,
        project_root: Option<PathBuf>,
    ) -> ConfigResult<Config> {
        let project = self.apply_env_overrides(project)?;
        let env_search_paths = env::var_os("KEEL_FFI_PATH")
            .map(|paths| env::split_paths(&paths).collect())
            .unwrap_or_default();

        Ok(Config {
            project,
            global,
            project_root,
            env_search_paths,
        })
    }

    /// Find project configuration by walking up directory tree
    ///
    /// Returns (project_root, project_config) or the default config when no
    /// keel.toml exists between `start_dir` and the filesystem root
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, ProjectConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let project_config = ProjectConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, ProjectConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.keel/config.toml
    ///
    /// A missing home directory or a missing file yields the default config;
    /// a file that exists but does not parse is an error.
    fn load_global_config(&mut self) -> ConfigResult<GlobalConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => match GlobalConfig::global_config_path() {
                Ok(path) => {
                    self.global_config_path = Some(path.clone());
                    path
                }
                Err(ConfigError::HomeNotFound) => return Ok(GlobalConfig::default()),
                Err(e) => return Err(e),
            },
        };

        if !path.exists() {
            return Ok(GlobalConfig::default());
        }

        GlobalConfig::load_from_file(&path)
    }

    /// Apply environment variable overrides to project config
    ///
    /// - KEEL_LOG: logging filter
    /// - KEEL_LOG_FORMAT: "compact" or "json"
    fn apply_env_overrides(&self, mut config: ProjectConfig) -> ConfigResult<ProjectConfig> {
        if let Ok(filter) = env::var("KEEL_LOG") {
            config
                .logging
                .get_or_insert_with(LoggingConfig::default)
                .filter = Some(filter);
        }

        if let Ok(format) = env::var("KEEL_LOG_FORMAT") {
            let format = match format.to_lowercase().as_str() {
                "compact" => LogFormat::Compact,
                "json" => LogFormat::Json,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "KEEL_LOG_FORMAT".to_string(),
                        reason: format!("expected 'compact' or 'json', got '{}'", other),
                    })
                }
            };
            config
                .logging
                .get_or_insert_with(LoggingConfig::default)
                .format = Some(format);
        }

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if this is a project (has keel.toml)
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }

    /// Library search paths in priority order: environment, project, global
    ///
    /// Relative project paths are resolved against the project root.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.env_search_paths.clone();
        if let Some(ffi) = &self.project.ffi {
            paths.extend(ffi.search_paths.iter().map(|p| self.resolve(p)));
        }
        if let Some(ffi) = &self.global.ffi {
            paths.extend(ffi.search_paths.iter().cloned());
        }
        paths
    }

    /// Bindings manifests, resolved against the project root
    pub fn manifests(&self) -> Vec<PathBuf> {
        self.project
            .ffi
            .as_ref()
            .map(|ffi| ffi.manifests.iter().map(|p| self.resolve(p)).collect())
            .unwrap_or_default()
    }

    /// Whether test overrides are checked against the declared return shape
    pub fn verify_overrides(&self) -> bool {
        self.project
            .ffi
            .as_ref()
            .and_then(|ffi| ffi.verify_overrides)
            .unwrap_or(true)
    }

    /// Effective logging filter
    pub fn log_filter(&self) -> &str {
        self.project
            .logging
            .as_ref()
            .and_then(|l| l.filter.as_deref())
            .or_else(|| self.global.logging.as_ref().and_then(|l| l.filter.as_deref()))
            .unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Effective logging format
    pub fn log_format(&self) -> LogFormat {
        self.project
            .logging
            .as_ref()
            .and_then(|l| l.format)
            .or_else(|| self.global.logging.as_ref().and_then(|l| l.format))
            .unwrap_or_default()
    }

    /// Whether a `[security]` section is present (foreign calls are then deny-by-default)
    pub fn restricts_foreign_calls(&self) -> bool {
        self.project.security.is_some()
    }

    /// Granted foreign calls from the `[security]` section
    pub fn foreign_grants(&self) -> &[String] {
        self.project
            .security
            .as_ref()
            .map(|s| s.foreign.as_slice())
            .unwrap_or(&[])
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.project_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}
