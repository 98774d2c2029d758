//! Error types for ss-relay
//!
//! Subsystem errors live next to their subsystem (`shadowsocks::ShadowsocksError`,
//! `ss_inbound::ShadowsocksInboundError`). This module holds the top-level
//! error plus the configuration and IPC errors shared by the binary.

use std::io;

use thiserror::Error;

use crate::shadowsocks::ShadowsocksError;
use crate::ss_inbound::ShadowsocksInboundError;

/// Any error the relay process can surface
#[derive(Debug, Error)]
pub enum SsRelayError {
    /// The configuration file could not be used
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Port, credential, or relay errors
    #[error("relay: {0}")]
    Inbound(#[from] ShadowsocksInboundError),

    /// A key names an unsupported cipher or an empty secret
    #[error("cipher: {0}")]
    Cipher(#[from] ShadowsocksError),

    /// Management socket failure
    #[error("ipc: {0}")]
    Ipc(#[from] IpcError),

    /// Bare I/O failure
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl SsRelayError {
    /// Whether retrying the same operation may succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Cipher(_) => false,
            Self::Inbound(e) => e.is_recoverable(),
            Self::Ipc(e) => e.is_recoverable(),
            Self::Io(e) => transient_io(e),
        }
    }
}

fn transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
    )
}

/// Errors loading, validating, or writing the JSON configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No file at the given path
    #[error("no configuration file at {path}")]
    FileNotFound { path: String },

    /// The file is not valid JSON for [`crate::config::SsRelayConfig`]
    #[error("invalid configuration JSON: {0}")]
    ParseError(String),

    /// Structurally valid JSON with an unusable value
    #[error("invalid configuration: {0}")]
    ValidationError(String),

    /// An `SS_RELAY_*` override could not be parsed
    #[error("bad value in ${name}: {reason}")]
    EnvError { name: String, reason: String },

    /// Reading or writing the file failed
    #[error("configuration file I/O: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Never recoverable; the file has to be fixed first
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Shorthand for [`ConfigError::ValidationError`]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Errors on the management socket, on either the server or the client side
#[derive(Debug, Error)]
pub enum IpcError {
    /// The socket file could not be created or bound
    #[error("cannot listen on {path}: {reason}")]
    BindError { path: String, reason: String },

    /// The client could not reach the server
    #[error("cannot connect to management socket: {0}")]
    ConnectionError(String),

    /// Oversized or malformed frame, or an unexpected response
    #[error("management protocol violation: {0}")]
    ProtocolError(String),

    /// A message could not be encoded as JSON
    #[error("cannot encode management message: {0}")]
    SerializationError(String),

    /// Socket I/O failed mid-exchange
    #[error("management socket I/O: {0}")]
    IoError(#[from] io::Error),
}

impl IpcError {
    /// Whether a new request on a fresh connection may succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } | Self::SerializationError(_) => false,
            Self::ConnectionError(_) | Self::ProtocolError(_) => true,
            Self::IoError(e) => transient_io(e),
        }
    }

    /// Shorthand for [`IpcError::ProtocolError`]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Shorthand for [`IpcError::SerializationError`]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

/// Result carrying an [`SsRelayError`]
pub type Result<T> = std::result::Result<T, SsRelayError>;
