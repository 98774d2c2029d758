//! Configuration types for ss-relay
//!
//! This module defines all configuration structures used by the relay.
//! Configuration is loaded from JSON files and validated structurally at
//! load time. Cipher names and duplicate key ids are checked per key during
//! reconciliation so that one bad key never blocks the others.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SsRelayConfig {
    /// Access keys to serve
    pub keys: Vec<AccessKeyConfig>,

    /// Relay tunables
    #[serde(default)]
    pub server: ServerConfig,

    /// IPC configuration
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl SsRelayConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, key) in self.keys.iter().enumerate() {
            key.validate()
                .map_err(|e| ConfigError::validation(format!("keys[{index}]: {e}")))?;
        }

        self.server.validate()?;
        self.ipc.validate()?;
        self.log.validate()?;

        Ok(())
    }

    /// Create a minimal default configuration with one example key
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            keys: vec![AccessKeyConfig {
                id: "default".into(),
                port: 8388,
                cipher: default_cipher(),
                secret: "change-me".into(),
            }],
            ..Self::default()
        }
    }

    /// Distinct ports referenced by the keys
    #[must_use]
    pub fn ports(&self) -> HashSet<u16> {
        self.keys.iter().map(|k| k.port).collect()
    }
}

/// One access key: identity, port, and cipher parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessKeyConfig {
    /// Access key identity, unique per port
    pub id: String,

    /// Port the key is served on
    pub port: u16,

    /// Cipher method name
    #[serde(default = "default_cipher")]
    pub cipher: String,

    /// Shared secret
    pub secret: String,
}

impl AccessKeyConfig {
    /// Structural validation; cipher names are checked at reconcile time
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::validation("key id cannot be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::validation(format!(
                "key '{}' has port 0",
                self.id
            )));
        }
        Ok(())
    }
}

/// Relay tunables shared by every port
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address every port binds on
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,

    /// UDP NAT session idle timeout in seconds
    #[serde(default = "default_nat_timeout_secs")]
    pub nat_timeout_secs: u64,

    /// Salts remembered for replay detection (0 disables)
    #[serde(default)]
    pub replay_history: usize,

    /// TCP handshake read deadline in seconds
    #[serde(default = "default_tcp_read_timeout_secs")]
    pub tcp_read_timeout_secs: u64,

    /// Upstream TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Consecutive ports tried when adding a key on an unavailable port
    #[serde(default = "default_port_scan_limit")]
    pub port_scan_limit: u16,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub tcp_backlog: u32,

    /// Permit loopback, private, and other non-public upstream targets
    #[serde(default)]
    pub allow_private_destinations: bool,
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("nat_timeout_secs", self.nat_timeout_secs),
            ("tcp_read_timeout_secs", self.tcp_read_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::validation(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.port_scan_limit == 0 {
            return Err(ConfigError::validation(
                "port_scan_limit must be greater than 0",
            ));
        }

        if self.tcp_backlog == 0 {
            return Err(ConfigError::validation("tcp_backlog must be greater than 0"));
        }

        Ok(())
    }

    /// Get NAT timeout as Duration
    #[must_use]
    pub const fn nat_timeout(&self) -> Duration {
        Duration::from_secs(self.nat_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            nat_timeout_secs: default_nat_timeout_secs(),
            replay_history: 0,
            tcp_read_timeout_secs: default_tcp_read_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            port_scan_limit: default_port_scan_limit(),
            tcp_backlog: default_backlog(),
            allow_private_destinations: false,
        }
    }
}

/// IPC configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    /// Enable IPC server
    #[serde(default)]
    pub enabled: bool,

    /// Path to Unix socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Socket file mode (octal, e.g., 0o660)
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl IpcConfig {
    /// Validate IPC configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::validation(
                "IPC socket path cannot be empty when IPC is enabled",
            ));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::validation(
                "max_message_size must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default)]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::validation(format!(
                "log format must be 'json' or 'text', got '{other}'"
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

// Default value functions for serde
fn default_cipher() -> String {
    "chacha20-ietf-poly1305".into()
}

const fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_nat_timeout_secs() -> u64 {
    300
}

const fn default_tcp_read_timeout_secs() -> u64 {
    59
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_port_scan_limit() -> u16 {
    16
}

const fn default_backlog() -> u32 {
    1024
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/ss-relay.sock")
}

const fn default_socket_mode() -> u32 {
    0o660
}

const fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
