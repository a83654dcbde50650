//! Structured logging setup
//!
//! Keel emits `tracing` events from every layer (linking, calls, override
//! installation, finalization). Hosts that already configure a subscriber
//! need nothing from this module; `init_logging` is for hosts that don't.

use keel_config::{Config, LogFormat};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("failed to initialize logging: {0}")]
    AlreadyInitialized(String),
}

/// Build the event filter; `RUST_LOG` takes precedence over `filter`
pub fn env_filter(filter: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return Ok(from_env);
    }
    EnvFilter::try_new(filter).map_err(|e| LoggingError::InvalidFilter {
        filter: filter.to_string(),
        reason: e.to_string(),
    })
}

/// Install a global subscriber writing to stderr
pub fn init_logging(filter: &str, format: LogFormat) -> Result<(), LoggingError> {
    let env_filter = env_filter(filter)?;

    let result = match format {
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .compact()
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing::debug!(filter, ?format, "logging initialized");
    Ok(())
}

/// `init_logging` with the `[logging]` settings of a loaded configuration
pub fn init_from_config(config: &Config) -> Result<(), LoggingError> {
    init_logging(config.log_filter(), config.log_format())
}
