//! Shadowsocks AEAD protocol support
//!
//! This module provides the cryptographic and framing layer used by the
//! inbound relay services in [`crate::ss_inbound`].
//!
//! # Supported Ciphers
//!
//! - `chacha20-ietf-poly1305` (default)
//! - `aes-256-gcm`
//! - `aes-128-gcm`
//!
//! Key derivation, the AEAD primitives and the SOCKS address codec come from
//! the `shadowsocks` crate. Chunk framing is local so that a stream can resume
//! after its first length block was opened during identification.
//!
//! # Layers
//!
//! ```text
//! Credential (identity, method, master key)
//!     |
//!     +-- stream:  salt | [sealed len][sealed payload] ...   (TCP)
//!     +-- packet:  salt | sealed(address || payload)          (UDP)
//!     |
//! AeadCipher (shadowsocks::crypto::v1::Cipher per salt)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use ss_relay::shadowsocks::{Credential, ShadowsocksMethod};
//!
//! let cred = Credential::new("user-1", ShadowsocksMethod::Chacha20IetfPoly1305, "secret")?;
//! let packet = cred.seal_packet(b"...")?;
//! ```

mod address;
mod cipher;
mod credential;
mod error;
mod method;
mod packet;
mod stream;

pub use address::ShadowsocksDestination;
pub use cipher::AeadCipher;
pub use credential::Credential;
pub use error::ShadowsocksError;
pub use method::{ShadowsocksMethod, MAX_SALT_LEN, TAG_LEN};
pub use packet::{decode_datagram, encode_datagram, open_packet, seal_packet};
pub use stream::{open_stream_prefix, random_salt, AeadReader, AeadWriter, StreamPrefix, MAX_PAYLOAD_LEN};
