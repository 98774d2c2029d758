//! Cipher identification
//!
//! Finds which credential of a port produced an inbound stream or packet:
//!
//! ```text
//! raw prefix ──► replay lookup ──► trial decryption ──► check_and_record(salt)
//!                   (read-only)     (snapshot order)       (authenticated only)
//! ```
//!
//! Only salts that authenticated under some credential are recorded, so
//! garbage traffic can neither fill nor flush the replay cache.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::credentials::{identify_packet, identify_stream, required_stream_prefix, CredentialSet, TrialResult};
use super::error::{ShadowsocksInboundError, ShadowsocksInboundResult};
use super::replay::ReplayCache;
use crate::shadowsocks::{decode_datagram, AeadReader, Credential, ShadowsocksDestination};
use crate::stats::IdentificationOutcome;

/// A TCP stream whose credential has been identified
pub struct IdentifiedStream<R> {
    /// Matching credential
    pub credential: Arc<Credential>,
    /// Decrypting reader positioned at the first payload chunk
    pub reader: AeadReader<R>,
}

impl<R> std::fmt::Debug for IdentifiedStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentifiedStream")
            .field("credential", &self.credential.identity())
            .finish_non_exhaustive()
    }
}

/// First packet of a UDP session, authenticated and split into target and payload
#[derive(Debug)]
pub struct IdentifiedPacket {
    /// Matching credential
    pub credential: Arc<Credential>,
    /// Decoded target address
    pub target: ShadowsocksDestination,
    /// Payload after the target address
    pub payload: Vec<u8>,
}

/// Map an identification error to its metrics outcome
#[must_use]
pub fn outcome_of(result: &ShadowsocksInboundResult<impl Sized>) -> IdentificationOutcome {
    match result {
        Ok(_) => IdentificationOutcome::Success,
        Err(ShadowsocksInboundError::ReplayDetected) => IdentificationOutcome::Replay,
        Err(ShadowsocksInboundError::DecodeError(_)) => IdentificationOutcome::DecodeError,
        Err(ShadowsocksInboundError::HandshakeTimeout) => IdentificationOutcome::Timeout,
        Err(_) => IdentificationOutcome::NoMatch,
    }
}

/// Whether any salt length used by `snapshot` is a remembered salt
fn seen_before(replay: &ReplayCache, snapshot: &[Arc<Credential>], data: &[u8]) -> bool {
    if !replay.is_enabled() {
        return false;
    }
    // Supported salts are either 16 or 32 bytes
    let mut checked = [false; 2];
    for cred in snapshot {
        let salt_len = cred.method().salt_len();
        let slot = usize::from(salt_len > 16);
        if checked[slot] || data.len() < salt_len {
            continue;
        }
        checked[slot] = true;
        if replay.contains(&data[..salt_len]) {
            return true;
        }
    }
    false
}

/// Identify the credential of a TCP client stream
///
/// Reads until the longest stream prefix of the current snapshot is
/// buffered (or the client stops sending), then trial-decrypts. Bytes read
/// past the prefix are kept in the returned reader.
///
/// The caller is responsible for the read deadline.
///
/// # Errors
///
/// - `NoMatchingCredential` when no credential authenticates the prefix,
///   including when the set is empty or the client closes early
/// - `ReplayDetected` when the salt was seen before
/// - `DecodeError` when a credential matched but the first length is invalid
/// - `Io` on transport errors
pub async fn identify_tcp<R>(
    mut stream: R,
    credentials: &CredentialSet,
    replay: &ReplayCache,
) -> ShadowsocksInboundResult<IdentifiedStream<R>>
where
    R: AsyncRead + Unpin,
{
    let snapshot = credentials.snapshot();
    let required = required_stream_prefix(&snapshot);
    if required == 0 {
        return Err(ShadowsocksInboundError::NoMatchingCredential);
    }

    let mut buf = BytesMut::with_capacity(required.max(1024));
    while buf.len() < required {
        if stream.read_buf(&mut buf).await? == 0 {
            break;
        }
    }

    if seen_before(replay, &snapshot, &buf) {
        return Err(ShadowsocksInboundError::ReplayDetected);
    }

    let (credential, opened) = match identify_stream(&snapshot, &buf) {
        TrialResult::Matched(found) => found,
        TrialResult::Malformed { identity, error } => {
            debug!(port = credentials.port(), key = %identity, error = %error, "Invalid first chunk length");
            return Err(ShadowsocksInboundError::decode(error.to_string()));
        }
        TrialResult::NoMatch => return Err(ShadowsocksInboundError::NoMatchingCredential),
    };

    let salt_len = credential.method().salt_len();
    if !replay.check_and_record(&buf[..salt_len]) {
        return Err(ShadowsocksInboundError::ReplayDetected);
    }

    let rest = buf.split_off(opened.consumed);
    let reader = AeadReader::new(stream, opened.cipher, rest, Some(opened.first_len));
    Ok(IdentifiedStream { credential, reader })
}

/// Identify the credential of the first UDP packet of a new session
///
/// The salt is recorded only once the target address has decoded, so a
/// packet that is dropped never occupies the replay cache.
///
/// # Errors
///
/// `NoMatchingCredential`, `ReplayDetected`, or `DecodeError` when a
/// credential matched but the target address is malformed.
pub fn identify_udp(
    packet: &[u8],
    credentials: &CredentialSet,
    replay: &ReplayCache,
) -> ShadowsocksInboundResult<IdentifiedPacket> {
    let snapshot = credentials.snapshot();
    if snapshot.is_empty() {
        return Err(ShadowsocksInboundError::NoMatchingCredential);
    }
    if seen_before(replay, &snapshot, packet) {
        return Err(ShadowsocksInboundError::ReplayDetected);
    }

    let (credential, plaintext) = identify_packet(&snapshot, packet).into_result()?;
    let (target, payload) = decode_datagram(&plaintext).map_err(|e| {
        debug!(port = credentials.port(), key = credential.identity(), error = %e, "Bad UDP target address");
        ShadowsocksInboundError::decode(e.to_string())
    })?;
    let payload = payload.to_vec();

    let salt_len = credential.method().salt_len();
    if !replay.check_and_record(&packet[..salt_len]) {
        return Err(ShadowsocksInboundError::ReplayDetected);
    }
    Ok(IdentifiedPacket {
        credential,
        target,
        payload,
    })
}
