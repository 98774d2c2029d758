//! Shadowsocks AEAD cipher methods
//!
//! Only the SIP004 AEAD methods are accepted. Stream ciphers and the
//! 2022 edition are rejected at credential construction time.

use serde::{Deserialize, Serialize};
use shadowsocks::crypto::CipherKind;

use super::error::ShadowsocksError;

/// AEAD authentication tag length shared by every supported method
pub const TAG_LEN: usize = 16;

/// Largest salt any supported method uses
pub const MAX_SALT_LEN: usize = 32;

/// Shadowsocks encryption method
///
/// The default is `chacha20-ietf-poly1305`, which is also the method used
/// for access keys added through the management interface when none is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShadowsocksMethod {
    /// aes-128-gcm
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,

    /// aes-256-gcm
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,

    /// chacha20-ietf-poly1305
    #[serde(rename = "chacha20-ietf-poly1305")]
    Chacha20IetfPoly1305,
}

impl Default for ShadowsocksMethod {
    fn default() -> Self {
        Self::Chacha20IetfPoly1305
    }
}

impl ShadowsocksMethod {
    /// Get the method name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
        }
    }

    /// Convert to the shadowsocks crate's cipher kind
    #[must_use]
    pub const fn cipher_kind(&self) -> CipherKind {
        match self {
            Self::Aes128Gcm => CipherKind::AES_128_GCM,
            Self::Aes256Gcm => CipherKind::AES_256_GCM,
            Self::Chacha20IetfPoly1305 => CipherKind::CHACHA20_POLY1305,
        }
    }

    /// Key length in bytes
    #[must_use]
    pub fn key_len(&self) -> usize {
        self.cipher_kind().key_len()
    }

    /// Salt length in bytes (equal to the key length for SIP004 methods)
    #[must_use]
    pub fn salt_len(&self) -> usize {
        self.cipher_kind().salt_len()
    }

    /// Bytes a TCP client must send before its identity can be tested:
    /// the salt plus the sealed two-byte length of the first chunk.
    #[must_use]
    pub fn stream_prefix_len(&self) -> usize {
        self.salt_len() + 2 + TAG_LEN
    }

    /// Smallest UDP packet that can possibly authenticate
    #[must_use]
    pub fn min_packet_len(&self) -> usize {
        self.salt_len() + TAG_LEN
    }

    /// Parse method from string
    ///
    /// # Errors
    ///
    /// Returns an error if the method string is not recognized.
    pub fn parse_method(s: &str) -> Result<Self, ShadowsocksError> {
        match s.trim().to_lowercase().as_str() {
            "aes-128-gcm" => Ok(Self::Aes128Gcm),
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(Self::Chacha20IetfPoly1305),
            _ => Err(ShadowsocksError::InvalidMethod(s.to_string())),
        }
    }
}

impl std::fmt::Display for ShadowsocksMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ShadowsocksMethod {
    type Err = ShadowsocksError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_method(s)
    }
}
