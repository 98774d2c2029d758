//! AEAD packet framing for UDP
//!
//! ```text
//! [salt][sealed (target address || payload) + tag]
//! ```
//!
//! Every packet has its own salt, so the nonce is always zero.

use super::address::ShadowsocksDestination;
use super::cipher::AeadCipher;
use super::error::ShadowsocksError;
use super::method::ShadowsocksMethod;
use super::stream::random_salt;

/// Seal `plaintext` into a standalone packet with a fresh salt
///
/// # Errors
///
/// Returns `KeyDerivation` or `EncryptFailed` from the cipher layer.
pub fn seal_packet(
    method: ShadowsocksMethod,
    master_key: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, ShadowsocksError> {
    let salt = random_salt(method);
    let mut cipher = AeadCipher::new(method, master_key, &salt)?;
    let mut out = salt;
    cipher.seal_append(plaintext, &mut out)?;
    Ok(out)
}

/// Authenticate and decrypt a packet
///
/// # Errors
///
/// - `DecryptFailed` if the packet is too short or does not authenticate
pub fn open_packet(
    method: ShadowsocksMethod,
    master_key: &[u8],
    packet: &[u8],
) -> Result<Vec<u8>, ShadowsocksError> {
    if packet.len() < method.min_packet_len() {
        return Err(ShadowsocksError::DecryptFailed);
    }
    let (salt, sealed) = packet.split_at(method.salt_len());
    let mut cipher = AeadCipher::new(method, master_key, salt)?;
    cipher.open(sealed)
}

/// Prefix `payload` with the SOCKS form of `addr`
///
/// # Errors
///
/// Returns `ProtocolError` if the address cannot be encoded.
pub fn encode_datagram(
    addr: &ShadowsocksDestination,
    payload: &[u8],
) -> Result<Vec<u8>, ShadowsocksError> {
    let mut out = Vec::with_capacity(addr.serialized_len() + payload.len());
    addr.write_to(&mut out)?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a decrypted datagram into its address and payload
///
/// # Errors
///
/// Returns `ProtocolError` if the address is malformed.
pub fn decode_datagram(plaintext: &[u8]) -> Result<(ShadowsocksDestination, &[u8]), ShadowsocksError> {
    let (addr, used) = ShadowsocksDestination::parse(plaintext)?;
    Ok((addr, &plaintext[used..]))
}
