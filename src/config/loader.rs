//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment
//! variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        "Configuration loaded: listen={}, hostname={}",
        config.server.listen, config.server.hostname
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `L2TP_LISTEN_ADDR`: Override listen address
/// - `L2TP_HOSTNAME`: Override the Host Name AVP
/// - `L2TP_LOG_LEVEL`: Override log level
/// - `L2TP_IDLE_TIMEOUT_SECS`: Override idle-tunnel timeout
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing, or an override value is
/// invalid.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(addr) = std::env::var("L2TP_LISTEN_ADDR") {
        config.server.listen = addr.parse().map_err(|e| {
            ConfigError::ParseError(format!("Invalid L2TP_LISTEN_ADDR '{addr}': {e}"))
        })?;
        debug!("Listen address overridden from environment: {addr}");
    }

    if let Ok(hostname) = std::env::var("L2TP_HOSTNAME") {
        config.server.hostname = hostname;
    }

    if let Ok(level) = std::env::var("L2TP_LOG_LEVEL") {
        config.log.level = level;
    }

    if let Ok(timeout) = std::env::var("L2TP_IDLE_TIMEOUT_SECS") {
        config.server.idle_timeout_secs = timeout.parse().map_err(|e| {
            ConfigError::ParseError(format!("Invalid L2TP_IDLE_TIMEOUT_SECS '{timeout}': {e}"))
        })?;
    }

    config.validate()?;

    Ok(config)
}

/// Write a default configuration file
///
/// # Errors
///
/// Returns `ConfigError` if serialization or the write fails.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    std::fs::write(path.as_ref(), json)?;
    Ok(())
}
