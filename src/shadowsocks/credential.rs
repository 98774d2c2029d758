//! Access credentials
//!
//! A credential binds an access-key identity to a cipher method and the
//! master key derived from its secret. Credentials are immutable once built
//! and are shared between bindings as `Arc<Credential>`.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use shadowsocks::{config::ServerConfig, ServerAddr};

use super::cipher::AeadCipher;
use super::error::ShadowsocksError;
use super::method::ShadowsocksMethod;
use super::packet::{open_packet, seal_packet};
use super::stream::{open_stream_prefix, StreamPrefix};

/// An access key ready to authenticate traffic
#[derive(Clone)]
pub struct Credential {
    identity: String,
    method: ShadowsocksMethod,
    secret: String,
    master_key: Box<[u8]>,
}

impl Credential {
    /// Build a credential from an identity, method and secret
    ///
    /// # Errors
    ///
    /// Returns `InvalidPassword` for an empty secret or an empty identity, or
    /// when the shadowsocks crate refuses the secret for this method.
    pub fn new(
        identity: impl Into<String>,
        method: ShadowsocksMethod,
        secret: impl Into<String>,
    ) -> Result<Self, ShadowsocksError> {
        let identity = identity.into();
        let secret = secret.into();
        if identity.is_empty() {
            return Err(ShadowsocksError::InvalidPassword(
                "access key id must not be empty".into(),
            ));
        }
        if secret.is_empty() {
            return Err(ShadowsocksError::InvalidPassword(format!(
                "secret for '{identity}' must not be empty"
            )));
        }

        // The bind address is irrelevant; only the derived key is kept
        let unbound = ServerAddr::SocketAddr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let server = ServerConfig::new(unbound, secret.clone(), method.cipher_kind())
            .map_err(|e| ShadowsocksError::InvalidPassword(format!("'{identity}': {e}")))?;
        let master_key: Box<[u8]> = server.key().into();
        Ok(Self {
            identity,
            method,
            secret,
            master_key,
        })
    }

    /// Build a credential from a cipher name as written in configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidMethod` for an unsupported cipher name, or the errors
    /// of [`Credential::new`].
    pub fn from_cipher_name(
        identity: impl Into<String>,
        cipher: &str,
        secret: impl Into<String>,
    ) -> Result<Self, ShadowsocksError> {
        let method = ShadowsocksMethod::parse_method(cipher)?;
        Self::new(identity, method, secret)
    }

    /// Access-key identity
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Cipher method
    #[must_use]
    pub const fn method(&self) -> ShadowsocksMethod {
        self.method
    }

    /// Secret as configured
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Master key derived from the secret
    #[must_use]
    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    /// Bytes of stream prefix needed before [`Credential::open_stream`] can succeed
    #[must_use]
    pub fn stream_prefix_len(&self) -> usize {
        self.method.stream_prefix_len()
    }

    /// Try to authenticate the opening bytes of a TCP stream
    ///
    /// # Errors
    ///
    /// `DecryptFailed` when the stream belongs to another credential.
    pub fn open_stream(&self, prefix: &[u8]) -> Result<StreamPrefix, ShadowsocksError> {
        open_stream_prefix(self.method, &self.master_key, prefix)
    }

    /// Session cipher for the given salt
    ///
    /// # Errors
    ///
    /// Returns `KeyDerivation` if the key material does not fit the method.
    pub fn cipher(&self, salt: &[u8]) -> Result<AeadCipher, ShadowsocksError> {
        AeadCipher::new(self.method, &self.master_key, salt)
    }

    /// Try to authenticate and decrypt a UDP packet
    ///
    /// # Errors
    ///
    /// `DecryptFailed` when the packet belongs to another credential.
    pub fn open_packet(&self, packet: &[u8]) -> Result<Vec<u8>, ShadowsocksError> {
        open_packet(self.method, &self.master_key, packet)
    }

    /// Seal a UDP packet under this credential
    ///
    /// # Errors
    ///
    /// Propagates cipher failures.
    pub fn seal_packet(&self, plaintext: &[u8]) -> Result<Vec<u8>, ShadowsocksError> {
        seal_packet(self.method, &self.master_key, plaintext)
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
            && self.method == other.method
            && self.master_key == other.master_key
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("method", &self.method)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_credential() {
        let cred = Credential::new("user-1", ShadowsocksMethod::Aes128Gcm, "pass").unwrap();
        assert_eq!(cred.identity(), "user-1");
        assert_eq!(cred.method(), ShadowsocksMethod::Aes128Gcm);
        assert_eq!(cred.master_key().len(), 16);
        assert_eq!(cred.stream_prefix_len(), 16 + 2 + 16);
    }

    #[test]
    fn test_master_key_matches_evp_bytes_to_key() {
        // First MD5 round of EVP_BytesToKey is MD5("password")
        let cred = Credential::new("k", ShadowsocksMethod::Aes128Gcm, "password").unwrap();
        assert_eq!(
            cred.master_key(),
            [
                0x5f, 0x4d, 0xcc, 0x3b, 0x5a, 0xa7, 0x65, 0xd6, 0x1d, 0x83, 0x27, 0xde, 0xb8,
                0x82, 0xcf, 0x99
            ]
        );

        let long = Credential::new("k", ShadowsocksMethod::Aes256Gcm, "password").unwrap();
        assert_eq!(long.master_key().len(), 32);
        assert_eq!(&long.master_key()[..16], cred.master_key());
    }

    #[test]
    fn test_from_cipher_name() {
        let cred = Credential::from_cipher_name("a", "chacha20-ietf-poly1305", "s").unwrap();
        assert_eq!(cred.method(), ShadowsocksMethod::Chacha20IetfPoly1305);

        let err = Credential::from_cipher_name("a", "rc4-md5", "s").unwrap_err();
        assert!(matches!(err, ShadowsocksError::InvalidMethod(_)));
    }

    #[test]
    fn test_empty_secret_rejected() {
        let err = Credential::new("a", ShadowsocksMethod::default(), "").unwrap_err();
        assert!(err.is_config_error());
        assert!(Credential::new("", ShadowsocksMethod::default(), "x").is_err());
    }

    #[test]
    fn test_equality() {
        let a = Credential::new("k", ShadowsocksMethod::Aes256Gcm, "one").unwrap();
        let b = Credential::new("k", ShadowsocksMethod::Aes256Gcm, "one").unwrap();
        let c = Credential::new("k", ShadowsocksMethod::Aes256Gcm, "two").unwrap();
        let d = Credential::new("k", ShadowsocksMethod::Chacha20IetfPoly1305, "one").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let cred = Credential::new("k", ShadowsocksMethod::default(), "hunter2").unwrap();
        let debug = format!("{cred:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_packet_belongs_to_one_credential() {
        let alice = Credential::new("alice", ShadowsocksMethod::default(), "a").unwrap();
        let bob = Credential::new("bob", ShadowsocksMethod::default(), "b").unwrap();
        let packet = alice.seal_packet(b"\x01\x7f\x00\x00\x01\x00\x35hi").unwrap();
        assert!(alice.open_packet(&packet).is_ok());
        assert!(bob.open_packet(&packet).is_err());
    }
}
