//! AEAD chunk framing for TCP streams
//!
//! Wire format, per direction:
//!
//! ```text
//! [salt][sealed len (2 + 16)][sealed payload (len + 16)][sealed len][sealed payload]...
//! ```
//!
//! `len` is a big-endian `u16` no larger than `MAX_PAYLOAD_LEN`. Both halves of
//! a chunk consume one nonce each.

use bytes::{Buf, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::cipher::AeadCipher;
use super::error::ShadowsocksError;
use super::method::{ShadowsocksMethod, TAG_LEN};

/// Largest payload a single chunk may carry
pub const MAX_PAYLOAD_LEN: usize = 0x3FFF;

const SEALED_LEN_SIZE: usize = 2 + TAG_LEN;

/// Result of authenticating the first length block of a stream
#[derive(Debug)]
pub struct StreamPrefix {
    /// Cipher positioned just after the length block
    pub cipher: AeadCipher,
    /// Payload length announced by the first chunk
    pub first_len: usize,
    /// Bytes of the input the salt and length block occupied
    pub consumed: usize,
}

/// Authenticate the salt and first sealed length block of a client stream
///
/// # Errors
///
/// - `ProtocolError` if `prefix` is shorter than the method's stream prefix
///   or the authenticated length is out of range
/// - `DecryptFailed` if the length block does not authenticate under `master_key`
pub fn open_stream_prefix(
    method: ShadowsocksMethod,
    master_key: &[u8],
    prefix: &[u8],
) -> Result<StreamPrefix, ShadowsocksError> {
    let salt_len = method.salt_len();
    let consumed = method.stream_prefix_len();
    if prefix.len() < consumed {
        return Err(ShadowsocksError::protocol("stream prefix too short"));
    }

    let mut cipher = AeadCipher::new(method, master_key, &prefix[..salt_len])?;
    let len_block = cipher.open(&prefix[salt_len..consumed])?;
    let first_len = decode_len(&len_block)?;

    Ok(StreamPrefix {
        cipher,
        first_len,
        consumed,
    })
}

fn decode_len(block: &[u8]) -> Result<usize, ShadowsocksError> {
    if block.len() != 2 {
        return Err(ShadowsocksError::protocol("length block has wrong size"));
    }
    let len = usize::from(u16::from_be_bytes([block[0], block[1]]));
    if len == 0 || len > MAX_PAYLOAD_LEN {
        return Err(ShadowsocksError::protocol(format!(
            "chunk length {len} out of range"
        )));
    }
    Ok(len)
}

/// Generate a random salt for `method`
#[must_use]
pub fn random_salt(method: ShadowsocksMethod) -> Vec<u8> {
    let mut salt = vec![0u8; method.salt_len()];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Decrypting half of a shadowsocks stream
pub struct AeadReader<R> {
    inner: R,
    cipher: AeadCipher,
    pending: BytesMut,
    pending_len: Option<usize>,
}

impl<R> AeadReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap `inner` with a cipher that has already been positioned
    ///
    /// `buffered` holds bytes that were read from `inner` but not yet
    /// consumed; `first_len` is set when the first length block was
    /// already opened during identification.
    pub fn new(inner: R, cipher: AeadCipher, buffered: BytesMut, first_len: Option<usize>) -> Self {
        Self {
            inner,
            cipher,
            pending: buffered,
            pending_len: first_len,
        }
    }

    /// Read the peer's salt from `inner` and set up the matching cipher
    ///
    /// # Errors
    ///
    /// Returns `Io` if the stream ends before a full salt arrives.
    pub async fn from_salted(
        mut inner: R,
        method: ShadowsocksMethod,
        master_key: &[u8],
    ) -> Result<Self, ShadowsocksError> {
        let mut salt = vec![0u8; method.salt_len()];
        inner.read_exact(&mut salt).await?;
        let cipher = AeadCipher::new(method, master_key, &salt)?;
        Ok(Self::new(inner, cipher, BytesMut::new(), None))
    }

    /// Read and decrypt the next chunk
    ///
    /// Returns `Ok(None)` on a clean end of stream (EOF on a chunk boundary).
    ///
    /// # Errors
    ///
    /// - `DecryptFailed` if a block does not authenticate
    /// - `ProtocolError` for a bad length or an EOF inside a chunk
    /// - `Io` for transport errors
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ShadowsocksError> {
        let len = match self.pending_len.take() {
            Some(len) => len,
            None => {
                if !self.fill(SEALED_LEN_SIZE).await? {
                    return Ok(None);
                }
                let sealed = self.pending.split_to(SEALED_LEN_SIZE);
                decode_len(&self.cipher.open(&sealed)?)?
            }
        };

        let needed = len + TAG_LEN;
        if !self.fill(needed).await? {
            return Err(ShadowsocksError::protocol("stream ended before chunk payload"));
        }
        let sealed = self.pending.split_to(needed);
        Ok(Some(self.cipher.open(&sealed)?))
    }

    /// Ensure at least `n` bytes are buffered.
    ///
    /// Returns `false` on EOF with nothing buffered; errors on EOF mid-block.
    async fn fill(&mut self, n: usize) -> Result<bool, ShadowsocksError> {
        while self.pending.len() < n {
            self.pending.reserve(n - self.pending.len());
            let read = self.inner.read_buf(&mut self.pending).await?;
            if read == 0 {
                if self.pending.is_empty() {
                    return Ok(false);
                }
                return Err(ShadowsocksError::protocol("stream ended mid-block"));
            }
        }
        Ok(true)
    }

    /// Number of buffered ciphertext bytes not yet consumed
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.remaining()
    }

    /// Consume the reader and return the underlying stream
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Encrypting half of a shadowsocks stream
///
/// The salt is sent together with the first chunk.
pub struct AeadWriter<W> {
    inner: W,
    cipher: AeadCipher,
    salt: Option<Vec<u8>>,
}

impl<W> AeadWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Create a writer that will announce `salt` before its first chunk
    ///
    /// # Errors
    ///
    /// Returns `KeyDerivation` if the key material does not fit the method.
    pub fn new(
        inner: W,
        method: ShadowsocksMethod,
        master_key: &[u8],
        salt: Vec<u8>,
    ) -> Result<Self, ShadowsocksError> {
        let cipher = AeadCipher::new(method, master_key, &salt)?;
        Ok(Self {
            inner,
            cipher,
            salt: Some(salt),
        })
    }

    /// Encrypt `data` into one or more chunks and write them out
    ///
    /// # Errors
    ///
    /// Returns `Io` on transport failure, `EncryptFailed` if sealing fails.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), ShadowsocksError> {
        let chunks = data.len().div_ceil(MAX_PAYLOAD_LEN).max(1);
        let mut out = Vec::with_capacity(
            self.salt.as_ref().map_or(0, Vec::len) + data.len() + chunks * (SEALED_LEN_SIZE + TAG_LEN),
        );
        if let Some(salt) = self.salt.take() {
            out.extend_from_slice(&salt);
        }
        for piece in data.chunks(MAX_PAYLOAD_LEN) {
            // Guarded by chunks(MAX_PAYLOAD_LEN)
            #[allow(clippy::cast_possible_truncation)]
            let len = (piece.len() as u16).to_be_bytes();
            self.cipher.seal_append(&len, &mut out)?;
            self.cipher.seal_append(piece, &mut out)?;
        }
        self.inner.write_all(&out).await?;
        Ok(())
    }

    /// Flush and shut down the write half of the underlying stream
    ///
    /// # Errors
    ///
    /// Returns the transport error, if any.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.flush().await?;
        self.inner.shutdown().await
    }

    /// Consume the writer and return the underlying stream
    pub fn into_inner(self) -> W {
        self.inner
    }
}
