//! Error types for Shadowsocks inbound operations
//!
//! This module defines error types for port bindings, credential-set
//! maintenance, reconciliation, and per-connection identification.
//!
//! # Error Categories
//!
//! - **Bind errors**: a port's TCP listener or UDP socket could not be opened
//! - **Credential errors**: duplicate identities, unknown ports, bad cipher config
//! - **Identification errors**: replayed salts, unknown keys, broken framing.
//!   These are never reported to the remote peer.
//! - **I/O errors**: network-related failures

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::shadowsocks::ShadowsocksError;

/// Error types for Shadowsocks inbound operations
#[derive(Debug, Error)]
pub enum ShadowsocksInboundError {
    /// Failed to bind the TCP listener or UDP socket of a port
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed {
        /// The address that failed to bind
        addr: SocketAddr,
        /// The reason for failure
        reason: String,
    },

    /// An access key with this identity already exists on the port
    #[error("Access key '{identity}' already exists on port {port}")]
    DuplicateIdentity {
        /// Access key identity
        identity: String,
        /// Port number
        port: u16,
    },

    /// No port in the scan window could be bound
    #[error("No bindable port in {first}..={last}")]
    PortUnavailable {
        /// First port tried
        first: u16,
        /// Last port tried
        last: u16,
    },

    /// The port has no active binding
    #[error("Port {0} is not bound")]
    PortNotFound(u16),

    /// Salt has already been seen
    #[error("Replayed salt detected")]
    ReplayDetected,

    /// No credential on the port authenticates the input
    #[error("No matching credential")]
    NoMatchingCredential,

    /// Framing error after a credential matched
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Identification did not finish before the read deadline
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Upstream target is not permitted
    #[error("Destination {0} is not allowed")]
    DestinationDenied(String),

    /// Upstream connection failed
    #[error("Failed to connect to {target}: {reason}")]
    ConnectFailed {
        /// Target as requested by the client
        target: String,
        /// The reason for failure
        reason: String,
    },

    /// Some ports failed to transition during reconciliation
    #[error("Reconciliation incomplete: {} port(s) failed", failures.len())]
    PartialReconcile {
        /// Per-port failures, in port order
        failures: Vec<(u16, ShadowsocksInboundError)>,
    },

    /// Reconciler has been shut down
    #[error("Relay is shutting down")]
    ShuttingDown,

    /// Cipher configuration or framing error
    #[error("Shadowsocks error: {0}")]
    Shadowsocks(#[from] ShadowsocksError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ShadowsocksInboundError {
    /// Create a bind failed error
    pub fn bind_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a duplicate identity error
    pub fn duplicate_identity(identity: impl Into<String>, port: u16) -> Self {
        Self::DuplicateIdentity {
            identity: identity.into(),
            port,
        }
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::DecodeError(msg.into())
    }

    /// Create a connect failed error
    pub fn connect_failed(target: impl ToString, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this is one of the per-connection identification failures
    #[must_use]
    pub const fn is_identification_failure(&self) -> bool {
        matches!(
            self,
            Self::ReplayDetected
                | Self::NoMatchingCredential
                | Self::DecodeError(_)
                | Self::HandshakeTimeout
        )
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors concern a single connection or packet and leave
    /// the port serving. Bind and configuration errors are not recoverable.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindFailed { .. }
            | Self::DuplicateIdentity { .. }
            | Self::PortUnavailable { .. }
            | Self::PortNotFound(_)
            | Self::PartialReconcile { .. }
            | Self::ShuttingDown => false,
            Self::ReplayDetected
            | Self::NoMatchingCredential
            | Self::DecodeError(_)
            | Self::HandshakeTimeout
            | Self::DestinationDenied(_)
            | Self::ConnectFailed { .. } => true,
            Self::Shadowsocks(e) => !e.is_config_error(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Convert `ShadowsocksInboundError` to `std::io::Error` for compatibility
impl From<ShadowsocksInboundError> for io::Error {
    fn from(e: ShadowsocksInboundError) -> Self {
        match e {
            ShadowsocksInboundError::Io(io_err) => io_err,
            ShadowsocksInboundError::BindFailed { .. }
            | ShadowsocksInboundError::PortUnavailable { .. } => {
                io::Error::new(io::ErrorKind::AddrInUse, e.to_string())
            }
            ShadowsocksInboundError::DuplicateIdentity { .. } => {
                io::Error::new(io::ErrorKind::AlreadyExists, e.to_string())
            }
            ShadowsocksInboundError::PortNotFound(_) => {
                io::Error::new(io::ErrorKind::NotFound, e.to_string())
            }
            ShadowsocksInboundError::ReplayDetected
            | ShadowsocksInboundError::NoMatchingCredential
            | ShadowsocksInboundError::DecodeError(_) => {
                io::Error::new(io::ErrorKind::InvalidData, e.to_string())
            }
            ShadowsocksInboundError::HandshakeTimeout => {
                io::Error::new(io::ErrorKind::TimedOut, e.to_string())
            }
            ShadowsocksInboundError::DestinationDenied(_) => {
                io::Error::new(io::ErrorKind::PermissionDenied, e.to_string())
            }
            ShadowsocksInboundError::ConnectFailed { .. } => {
                io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string())
            }
            ShadowsocksInboundError::ShuttingDown => {
                io::Error::new(io::ErrorKind::NotConnected, e.to_string())
            }
            ShadowsocksInboundError::Shadowsocks(ref inner) if inner.is_config_error() => {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            }
            ShadowsocksInboundError::Shadowsocks(_)
            | ShadowsocksInboundError::PartialReconcile { .. } => {
                io::Error::new(io::ErrorKind::Other, e.to_string())
            }
        }
    }
}

/// Type alias for Result with `ShadowsocksInboundError`
pub type ShadowsocksInboundResult<T> = std::result::Result<T, ShadowsocksInboundError>;
