//! Reading, overriding, and generating the JSON configuration
//!
//! Every entry point validates before returning, so callers never see a
//! structurally invalid config.

use std::path::Path;
use std::str::FromStr;

use tracing::{debug, info};

use super::types::SsRelayConfig;
use crate::error::ConfigError;

/// Read and validate the configuration file at `path`
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<SsRelayConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: SsRelayConfig = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: {} keys on {} ports",
        config.keys.len(),
        config.ports().len()
    );

    Ok(config)
}

/// Parse and validate configuration held in memory
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<SsRelayConfig, ConfigError> {
    let config: SsRelayConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

fn parse_number<T: FromStr>(name: &str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    value
        .map(|value| {
            value.parse().map_err(|_| ConfigError::EnvError {
                name: name.into(),
                reason: format!("Invalid number: {value}"),
            })
        })
        .transpose()
}

/// Apply environment variable overrides to a loaded configuration
///
/// Environment variables:
/// - `SS_RELAY_LOG_LEVEL`: Override log level
/// - `SS_RELAY_REPLAY_HISTORY`: Override replay cache capacity
/// - `SS_RELAY_NAT_TIMEOUT_SECS`: Override NAT session idle timeout
/// - `SS_RELAY_IPC_SOCKET`: Override IPC socket path
///
/// # Errors
///
/// Returns `ConfigError` if a variable cannot be parsed or the result does
/// not validate.
pub fn apply_env_overrides(config: &mut SsRelayConfig) -> Result<(), ConfigError> {
    apply_overrides(config, |name| std::env::var(name).ok())
}

fn apply_overrides(
    config: &mut SsRelayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(level) = lookup("SS_RELAY_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    let name = "SS_RELAY_REPLAY_HISTORY";
    if let Some(history) = parse_number(name, lookup(name))? {
        config.server.replay_history = history;
        debug!("Replay history overridden to {}", history);
    }

    let name = "SS_RELAY_NAT_TIMEOUT_SECS";
    if let Some(secs) = parse_number(name, lookup(name))? {
        config.server.nat_timeout_secs = secs;
        debug!("NAT timeout overridden to {}s", secs);
    }

    if let Some(socket) = lookup("SS_RELAY_IPC_SOCKET") {
        config.ipc.socket_path = socket.into();
        debug!("IPC socket path overridden to {:?}", config.ipc.socket_path);
    }

    // overrides may have broken a constraint
    config.validate()
}

/// [`load_config`] followed by [`apply_env_overrides`]
///
/// See [`apply_env_overrides`] for the recognized variables.
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<SsRelayConfig, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Write [`SsRelayConfig::default_config`] to `path` as pretty JSON
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = SsRelayConfig::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
