//! Per-salt AEAD session cipher
//!
//! Key schedule, as implemented by the `shadowsocks` crate:
//!
//! ```text
//! secret --EVP_BytesToKey(MD5)--> master key        (config::ServerConfig)
//! master key + salt --HKDF-SHA1("ss-subkey")--> subkey (crypto::v1::Cipher)
//! ```
//!
//! The crate's `v1::Cipher` also owns the little-endian nonce counter. This
//! wrapper adds the owned-buffer seal/open calls the framing code needs.

use shadowsocks::crypto::v1::Cipher;

use super::error::ShadowsocksError;
use super::method::{ShadowsocksMethod, TAG_LEN};

/// Session cipher: a salted subkey plus its nonce counter
///
/// Create once per direction of a TCP stream (or once per UDP packet) and
/// reuse it for every chunk in that direction.
pub struct AeadCipher {
    inner: Cipher,
}

impl AeadCipher {
    /// Build the session cipher for `salt` from a credential's master key
    ///
    /// # Errors
    ///
    /// Returns `KeyDerivation` if the key or salt length does not fit the method.
    pub fn new(
        method: ShadowsocksMethod,
        master_key: &[u8],
        salt: &[u8],
    ) -> Result<Self, ShadowsocksError> {
        if master_key.len() != method.key_len() || salt.len() != method.salt_len() {
            return Err(ShadowsocksError::KeyDerivation(format!(
                "{method} takes a {}-byte key and salt (got {} and {})",
                method.key_len(),
                master_key.len(),
                salt.len()
            )));
        }
        Ok(Self {
            inner: Cipher::new(method.cipher_kind(), master_key, salt),
        })
    }

    /// Encrypt `plaintext`, returning `ciphertext || tag`, and advance the nonce
    ///
    /// # Errors
    ///
    /// Never fails for the supported methods.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ShadowsocksError> {
        let mut out = Vec::with_capacity(plaintext.len() + TAG_LEN);
        self.seal_append(plaintext, &mut out)?;
        Ok(out)
    }

    /// Encrypt `plaintext` and append `ciphertext || tag` to `out`
    ///
    /// # Errors
    ///
    /// Never fails for the supported methods.
    pub fn seal_append(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), ShadowsocksError> {
        let start = out.len();
        out.extend_from_slice(plaintext);
        out.resize(start + plaintext.len() + self.inner.tag_len(), 0);
        self.inner.encrypt_packet(&mut out[start..]);
        Ok(())
    }

    /// Decrypt and authenticate `ciphertext || tag`
    ///
    /// # Errors
    ///
    /// Returns `DecryptFailed` if authentication fails or the input is shorter
    /// than a tag. The cipher must be discarded after a failure.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ShadowsocksError> {
        let tag_len = self.inner.tag_len();
        if ciphertext.len() < tag_len {
            return Err(ShadowsocksError::DecryptFailed);
        }
        let mut buf = ciphertext.to_vec();
        if !self.inner.decrypt_packet(&mut buf) {
            return Err(ShadowsocksError::DecryptFailed);
        }
        buf.truncate(ciphertext.len() - tag_len);
        Ok(buf)
    }
}

impl std::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadCipher").finish_non_exhaustive()
    }
}
