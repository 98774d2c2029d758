//! Shadowsocks error types
//!
//! This module defines error types for credential construction and for the
//! AEAD framing layer. Construction failures (`InvalidMethod`,
//! `InvalidPassword`) are what the reconciler treats as a cipher
//! configuration error for a single access key.

use std::fmt;
use std::io;

/// Shadowsocks-specific errors
#[derive(Debug)]
pub enum ShadowsocksError {
    /// Invalid encryption method specified
    InvalidMethod(String),

    /// Invalid or missing password
    InvalidPassword(String),

    /// Subkey derivation failed
    KeyDerivation(String),

    /// AEAD authentication failed while opening a chunk or packet
    DecryptFailed,

    /// AEAD sealing failed
    EncryptFailed,

    /// Malformed framing (truncated chunk, oversized length, bad address)
    ProtocolError(String),

    /// I/O error
    Io(io::Error),
}

impl ShadowsocksError {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Whether this error came from building a credential rather than from traffic
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidMethod(_) | Self::InvalidPassword(_))
    }
}

impl fmt::Display for ShadowsocksError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMethod(method) => {
                write!(f, "invalid Shadowsocks encryption method: {method}")
            }
            Self::InvalidPassword(reason) => {
                write!(f, "invalid Shadowsocks password: {reason}")
            }
            Self::KeyDerivation(reason) => {
                write!(f, "Shadowsocks key derivation failed: {reason}")
            }
            Self::DecryptFailed => write!(f, "Shadowsocks AEAD authentication failed"),
            Self::EncryptFailed => write!(f, "Shadowsocks AEAD encryption failed"),
            Self::ProtocolError(msg) => {
                write!(f, "Shadowsocks protocol error: {msg}")
            }
            Self::Io(e) => {
                write!(f, "Shadowsocks I/O error: {e}")
            }
        }
    }
}

impl std::error::Error for ShadowsocksError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ShadowsocksError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
