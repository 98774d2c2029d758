//! Per-port credential set
//!
//! Readers (relay tasks) take a lock-free snapshot via `ArcSwap` and run
//! trial decryption against it; writers (the reconciler) serialize on a
//! small mutex and publish a whole new vector. A reader therefore sees
//! either the old or the new set, never a mix.
//!
//! ```text
//!   relay tasks ──load()──► Arc<Vec<Arc<Credential>>> ◄──store()── reconciler
//!                                  (immutable)                    (write_lock)
//! ```

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::error::{ShadowsocksInboundError, ShadowsocksInboundResult};
use crate::shadowsocks::{Credential, ShadowsocksError, StreamPrefix};

/// Immutable view of a credential set at one point in time
pub type CredentialSnapshot = Arc<Vec<Arc<Credential>>>;

/// Ordered credentials accepted on one port
#[derive(Debug)]
pub struct CredentialSet {
    port: u16,
    current: ArcSwap<Vec<Arc<Credential>>>,
    write_lock: Mutex<()>,
}

impl CredentialSet {
    /// Create an empty set for `port`
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            current: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Port this set belongs to
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> CredentialSnapshot {
        self.current.load_full()
    }

    /// Number of credentials
    #[must_use]
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    /// Whether a credential with `identity` is present
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.current.load().iter().any(|c| c.identity() == identity)
    }

    /// Identities in stored order
    #[must_use]
    pub fn identities(&self) -> Vec<String> {
        self.current
            .load()
            .iter()
            .map(|c| c.identity().to_string())
            .collect()
    }

    /// Atomically swap the whole set
    ///
    /// # Errors
    ///
    /// Returns `DuplicateIdentity` if `credentials` repeats an identity; the
    /// current set is left untouched.
    pub fn replace(&self, credentials: Vec<Arc<Credential>>) -> ShadowsocksInboundResult<()> {
        for (i, cred) in credentials.iter().enumerate() {
            if credentials[..i].iter().any(|c| c.identity() == cred.identity()) {
                return Err(ShadowsocksInboundError::duplicate_identity(
                    cred.identity(),
                    self.port,
                ));
            }
        }

        let _guard = self.write_lock.lock();
        self.current.store(Arc::new(credentials));
        Ok(())
    }

    /// Append a credential
    ///
    /// # Errors
    ///
    /// Returns `DuplicateIdentity` if the identity is already present.
    pub fn add(&self, credential: Arc<Credential>) -> ShadowsocksInboundResult<()> {
        let _guard = self.write_lock.lock();
        let current = self.current.load();
        if current.iter().any(|c| c.identity() == credential.identity()) {
            return Err(ShadowsocksInboundError::duplicate_identity(
                credential.identity(),
                self.port,
            ));
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(credential);
        self.current.store(Arc::new(next));
        Ok(())
    }

    /// Remove the credential with `identity`, if any
    ///
    /// Returns whether the set is empty afterwards.
    pub fn remove(&self, identity: &str) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.current.load();
        if !current.iter().any(|c| c.identity() == identity) {
            return current.is_empty();
        }

        let next: Vec<_> = current
            .iter()
            .filter(|c| c.identity() != identity)
            .cloned()
            .collect();
        let empty = next.is_empty();
        self.current.store(Arc::new(next));
        empty
    }

    /// Trial-decrypt a TCP stream prefix against the current snapshot
    pub fn try_identify_stream(
        &self,
        prefix: &[u8],
    ) -> TrialResult<(Arc<Credential>, StreamPrefix)> {
        identify_stream(&self.snapshot(), prefix)
    }

    /// Trial-decrypt a UDP packet against the current snapshot
    pub fn try_identify_packet(&self, packet: &[u8]) -> TrialResult<(Arc<Credential>, Vec<u8>)> {
        identify_packet(&self.snapshot(), packet)
    }
}

/// Outcome of trial decryption
#[derive(Debug)]
pub enum TrialResult<T> {
    /// A credential authenticated the input
    Matched(T),
    /// A credential authenticated the input but its framing is invalid
    Malformed {
        /// Identity of the credential that matched
        identity: String,
        /// Framing error
        error: ShadowsocksError,
    },
    /// No credential authenticated the input
    NoMatch,
}

impl<T> TrialResult<T> {
    /// Convert into a result, mapping failures to identification errors
    ///
    /// # Errors
    ///
    /// `NoMatchingCredential` or `DecodeError`.
    pub fn into_result(self) -> ShadowsocksInboundResult<T> {
        match self {
            Self::Matched(v) => Ok(v),
            Self::Malformed { error, .. } => Err(ShadowsocksInboundError::decode(error.to_string())),
            Self::NoMatch => Err(ShadowsocksInboundError::NoMatchingCredential),
        }
    }
}

/// Bytes a TCP client must send before every credential of `snapshot` can be tried
#[must_use]
pub fn required_stream_prefix(snapshot: &[Arc<Credential>]) -> usize {
    snapshot
        .iter()
        .map(|c| c.stream_prefix_len())
        .max()
        .unwrap_or(0)
}

/// Try each credential of `snapshot` in order against a TCP stream prefix
///
/// Credentials needing more bytes than `prefix` holds are skipped.
pub fn identify_stream(
    snapshot: &[Arc<Credential>],
    prefix: &[u8],
) -> TrialResult<(Arc<Credential>, StreamPrefix)> {
    for cred in snapshot {
        if prefix.len() < cred.stream_prefix_len() {
            continue;
        }
        match cred.open_stream(prefix) {
            Ok(opened) => return TrialResult::Matched((Arc::clone(cred), opened)),
            Err(ShadowsocksError::DecryptFailed) => continue,
            Err(error) => {
                return TrialResult::Malformed {
                    identity: cred.identity().to_string(),
                    error,
                }
            }
        }
    }
    TrialResult::NoMatch
}

/// Try each credential of `snapshot` in order against a UDP packet
pub fn identify_packet(
    snapshot: &[Arc<Credential>],
    packet: &[u8],
) -> TrialResult<(Arc<Credential>, Vec<u8>)> {
    for cred in snapshot {
        match cred.open_packet(packet) {
            Ok(plaintext) => return TrialResult::Matched((Arc::clone(cred), plaintext)),
            Err(ShadowsocksError::DecryptFailed) => continue,
            Err(error) => {
                return TrialResult::Malformed {
                    identity: cred.identity().to_string(),
                    error,
                }
            }
        }
    }
    TrialResult::NoMatch
}
