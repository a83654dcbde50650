//! Configuration for the Keel native interop runtime
//!
//! A project's `keel.toml` names the bindings manifests to load, where to
//! look for native libraries, how to log, and (optionally) which foreign
//! calls are granted. `~/.keel/config.toml` supplies machine-wide defaults
//! for the same sections, except manifests.
//!
//! Sources merge global, then project, then environment:
//!
//! | variable          | effect                                   |
//! |-------------------|------------------------------------------|
//! | `KEEL_FFI_PATH`   | library search paths, searched first     |
//! | `KEEL_LOG`        | logging filter                           |
//! | `KEEL_LOG_FORMAT` | `compact` or `json`                      |
//!
//! ```no_run
//! use keel_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("manifests: {:?}", config.manifests());
//! ```

pub mod global;
pub mod loader;
pub mod project;

use std::path::PathBuf;
use thiserror::Error;

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub use global::GlobalConfig;
pub use loader::{Config, ConfigLoader};
pub use project::{FfiConfig, LogFormat, LoggingConfig, ProjectConfig, SecurityConfig};
