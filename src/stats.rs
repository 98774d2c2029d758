//! Relay metrics
//!
//! The relay services report what they do through the [`RelayMetrics`]
//! trait. [`RelayStats`] is the in-process implementation backing the
//! `get_stats` IPC command; [`NoopMetrics`] discards everything.
//!
//! Per-access-key counters live in a `DashMap` keyed by identity so that
//! concurrent connections of different keys never contend on one lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Transport an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// TCP stream
    Tcp,
    /// UDP packet
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Result of running the cipher identifier on a new stream or session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentificationOutcome {
    /// A credential matched and the salt was fresh
    Success,
    /// The salt was seen before
    Replay,
    /// No credential authenticated the input
    NoMatch,
    /// A credential matched but the framing was invalid
    DecodeError,
    /// The client did not send enough bytes before the deadline
    Timeout,
}

impl IdentificationOutcome {
    /// Label used in logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Replay => "replay",
            Self::NoMatch => "no_match",
            Self::DecodeError => "decode_error",
            Self::Timeout => "timeout",
        }
    }
}

/// How a TCP connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseStatus {
    /// Relayed until one side closed
    #[serde(rename = "OK")]
    Ok,
    /// No credential matched, or the salt was replayed
    #[serde(rename = "ERR_CIPHER")]
    ErrCipher,
    /// The target address could not be read
    #[serde(rename = "ERR_READ_ADDRESS")]
    ErrReadAddress,
    /// The target was refused by policy or could not be reached
    #[serde(rename = "ERR_CONNECT")]
    ErrConnect,
    /// Relay failed on the client side
    #[serde(rename = "ERR_RELAY_CLIENT")]
    ErrRelayClient,
    /// Relay failed on the target side
    #[serde(rename = "ERR_RELAY_TARGET")]
    ErrRelayTarget,
}

impl CloseStatus {
    /// Label used in logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::ErrCipher => "ERR_CIPHER",
            Self::ErrReadAddress => "ERR_READ_ADDRESS",
            Self::ErrConnect => "ERR_CONNECT",
            Self::ErrRelayClient => "ERR_RELAY_CLIENT",
            Self::ErrRelayTarget => "ERR_RELAY_TARGET",
        }
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plaintext bytes moved in each direction of a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBytes {
    /// Client to target
    pub client_to_target: u64,
    /// Target to client
    pub target_to_client: u64,
}

impl TransferBytes {
    /// Total bytes in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_target + self.target_to_client
    }
}

/// Sink for relay events
///
/// `key` is `None` when the event happened before a credential was identified.
pub trait RelayMetrics: Send + Sync {
    /// Access keys and ports after a reconciliation
    fn set_access_key_count(&self, keys: usize, ports: usize);

    /// Outcome of the cipher identifier
    fn record_identification(&self, port: u16, transport: Transport, outcome: IdentificationOutcome);

    /// A TCP connection was accepted
    fn tcp_connection_opened(&self, port: u16);

    /// A TCP connection finished
    fn tcp_connection_closed(
        &self,
        port: u16,
        key: Option<&str>,
        status: CloseStatus,
        bytes: TransferBytes,
        duration: Duration,
    );

    /// A UDP packet from a client was forwarded
    fn udp_packet_from_client(&self, port: u16, key: &str, bytes: usize);

    /// A UDP packet from a target was relayed back
    fn udp_packet_from_target(&self, port: u16, key: &str, bytes: usize);

    /// A NAT session was created
    fn nat_entry_added(&self, port: u16);

    /// A NAT session was removed
    fn nat_entry_removed(&self, port: u16);
}

/// Metrics sink that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl RelayMetrics for NoopMetrics {
    fn set_access_key_count(&self, _keys: usize, _ports: usize) {}
    fn record_identification(&self, _port: u16, _transport: Transport, _outcome: IdentificationOutcome) {}
    fn tcp_connection_opened(&self, _port: u16) {}
    fn tcp_connection_closed(
        &self,
        _port: u16,
        _key: Option<&str>,
        _status: CloseStatus,
        _bytes: TransferBytes,
        _duration: Duration,
    ) {
    }
    fn udp_packet_from_client(&self, _port: u16, _key: &str, _bytes: usize) {}
    fn udp_packet_from_target(&self, _port: u16, _key: &str, _bytes: usize) {}
    fn nat_entry_added(&self, _port: u16) {}
    fn nat_entry_removed(&self, _port: u16) {}
}

/// Counters for one access key
#[derive(Debug, Default)]
struct KeyCounters {
    tcp_connections: AtomicU64,
    udp_packets: AtomicU64,
    bytes_from_client: AtomicU64,
    bytes_to_client: AtomicU64,
}

/// Counters for one port
#[derive(Debug, Default)]
struct PortCounters {
    tcp_accepted: AtomicU64,
    tcp_active: AtomicU64,
    nat_active: AtomicU64,
    identification_failures: AtomicU64,
}

/// In-memory relay statistics
#[derive(Debug, Default)]
pub struct RelayStats {
    access_keys: AtomicU64,
    ports: AtomicU64,

    tcp_accepted: AtomicU64,
    tcp_active: AtomicU64,
    tcp_completed: AtomicU64,
    tcp_errored: AtomicU64,

    udp_packets_from_client: AtomicU64,
    udp_packets_from_target: AtomicU64,
    nat_active: AtomicU64,
    nat_created: AtomicU64,

    ident_success: AtomicU64,
    ident_replay: AtomicU64,
    ident_no_match: AtomicU64,
    ident_decode_error: AtomicU64,
    ident_timeout: AtomicU64,

    bytes_from_client: AtomicU64,
    bytes_to_client: AtomicU64,

    per_key: DashMap<String, KeyCounters>,
    per_port: DashMap<u16, PortCounters>,
}

impl RelayStats {
    /// Create empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_key(&self, key: &str, f: impl FnOnce(&KeyCounters)) {
        if let Some(counters) = self.per_key.get(key) {
            f(&counters);
            return;
        }
        f(&self.per_key.entry(key.to_string()).or_default());
    }

    fn with_port(&self, port: u16, f: impl FnOnce(&PortCounters)) {
        f(&self.per_port.entry(port).or_default());
    }

    /// Currently active TCP connections
    #[must_use]
    pub fn tcp_active(&self) -> u64 {
        self.tcp_active.load(Ordering::Relaxed)
    }

    /// Currently active NAT sessions
    #[must_use]
    pub fn nat_active(&self) -> u64 {
        self.nat_active.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut keys: Vec<KeyStatsSnapshot> = self
            .per_key
            .iter()
            .map(|entry| {
                let c = entry.value();
                KeyStatsSnapshot {
                    id: entry.key().clone(),
                    tcp_connections: c.tcp_connections.load(Ordering::Relaxed),
                    udp_packets: c.udp_packets.load(Ordering::Relaxed),
                    bytes_from_client: c.bytes_from_client.load(Ordering::Relaxed),
                    bytes_to_client: c.bytes_to_client.load(Ordering::Relaxed),
                }
            })
            .collect();
        keys.sort_by(|a, b| a.id.cmp(&b.id));

        let mut ports: Vec<PortStatsSnapshot> = self
            .per_port
            .iter()
            .map(|entry| {
                let c = entry.value();
                PortStatsSnapshot {
                    port: *entry.key(),
                    tcp_accepted: c.tcp_accepted.load(Ordering::Relaxed),
                    tcp_active: c.tcp_active.load(Ordering::Relaxed),
                    nat_active: c.nat_active.load(Ordering::Relaxed),
                    identification_failures: c.identification_failures.load(Ordering::Relaxed),
                }
            })
            .collect();
        ports.sort_by_key(|p| p.port);

        StatsSnapshot {
            access_keys: self.access_keys.load(Ordering::Relaxed),
            ports_bound: self.ports.load(Ordering::Relaxed),
            tcp_accepted: self.tcp_accepted.load(Ordering::Relaxed),
            tcp_active: self.tcp_active(),
            tcp_completed: self.tcp_completed.load(Ordering::Relaxed),
            tcp_errored: self.tcp_errored.load(Ordering::Relaxed),
            udp_packets_from_client: self.udp_packets_from_client.load(Ordering::Relaxed),
            udp_packets_from_target: self.udp_packets_from_target.load(Ordering::Relaxed),
            nat_active: self.nat_active(),
            nat_created: self.nat_created.load(Ordering::Relaxed),
            identification: IdentificationSnapshot {
                success: self.ident_success.load(Ordering::Relaxed),
                replay: self.ident_replay.load(Ordering::Relaxed),
                no_match: self.ident_no_match.load(Ordering::Relaxed),
                decode_error: self.ident_decode_error.load(Ordering::Relaxed),
                timeout: self.ident_timeout.load(Ordering::Relaxed),
            },
            bytes_from_client: self.bytes_from_client.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            keys,
            ports,
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

impl RelayMetrics for RelayStats {
    fn set_access_key_count(&self, keys: usize, ports: usize) {
        self.access_keys.store(keys as u64, Ordering::Relaxed);
        self.ports.store(ports as u64, Ordering::Relaxed);
    }

    fn record_identification(&self, port: u16, _transport: Transport, outcome: IdentificationOutcome) {
        let counter = match outcome {
            IdentificationOutcome::Success => &self.ident_success,
            IdentificationOutcome::Replay => &self.ident_replay,
            IdentificationOutcome::NoMatch => &self.ident_no_match,
            IdentificationOutcome::DecodeError => &self.ident_decode_error,
            IdentificationOutcome::Timeout => &self.ident_timeout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if outcome != IdentificationOutcome::Success {
            self.with_port(port, |p| {
                p.identification_failures.fetch_add(1, Ordering::Relaxed);
            });
        }
    }

    fn tcp_connection_opened(&self, port: u16) {
        self.tcp_accepted.fetch_add(1, Ordering::Relaxed);
        self.tcp_active.fetch_add(1, Ordering::Relaxed);
        self.with_port(port, |p| {
            p.tcp_accepted.fetch_add(1, Ordering::Relaxed);
            p.tcp_active.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn tcp_connection_closed(
        &self,
        port: u16,
        key: Option<&str>,
        status: CloseStatus,
        bytes: TransferBytes,
        _duration: Duration,
    ) {
        self.tcp_active.fetch_sub(1, Ordering::Relaxed);
        if status == CloseStatus::Ok {
            self.tcp_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tcp_errored.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_from_client
            .fetch_add(bytes.client_to_target, Ordering::Relaxed);
        self.bytes_to_client
            .fetch_add(bytes.target_to_client, Ordering::Relaxed);
        self.with_port(port, |p| {
            p.tcp_active.fetch_sub(1, Ordering::Relaxed);
        });

        if let Some(key) = key {
            self.with_key(key, |k| {
                k.tcp_connections.fetch_add(1, Ordering::Relaxed);
                k.bytes_from_client
                    .fetch_add(bytes.client_to_target, Ordering::Relaxed);
                k.bytes_to_client
                    .fetch_add(bytes.target_to_client, Ordering::Relaxed);
            });
        }
    }

    fn udp_packet_from_client(&self, _port: u16, key: &str, bytes: usize) {
        self.udp_packets_from_client.fetch_add(1, Ordering::Relaxed);
        self.bytes_from_client
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.with_key(key, |k| {
            k.udp_packets.fetch_add(1, Ordering::Relaxed);
            k.bytes_from_client.fetch_add(bytes as u64, Ordering::Relaxed);
        });
    }

    fn udp_packet_from_target(&self, _port: u16, key: &str, bytes: usize) {
        self.udp_packets_from_target.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(bytes as u64, Ordering::Relaxed);
        self.with_key(key, |k| {
            k.bytes_to_client.fetch_add(bytes as u64, Ordering::Relaxed);
        });
    }

    fn nat_entry_added(&self, port: u16) {
        self.nat_created.fetch_add(1, Ordering::Relaxed);
        self.nat_active.fetch_add(1, Ordering::Relaxed);
        self.with_port(port, |p| {
            p.nat_active.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn nat_entry_removed(&self, port: u16) {
        self.nat_active.fetch_sub(1, Ordering::Relaxed);
        self.with_port(port, |p| {
            p.nat_active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

/// Snapshot of relay statistics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Access keys after the last reconciliation
    pub access_keys: u64,
    /// Ports bound after the last reconciliation
    pub ports_bound: u64,
    /// Total TCP connections accepted
    pub tcp_accepted: u64,
    /// Currently active TCP connections
    pub tcp_active: u64,
    /// TCP connections that relayed until a clean close
    pub tcp_completed: u64,
    /// TCP connections that ended with an error
    pub tcp_errored: u64,
    /// UDP packets forwarded from clients
    pub udp_packets_from_client: u64,
    /// UDP packets relayed back to clients
    pub udp_packets_from_target: u64,
    /// Currently active NAT sessions
    pub nat_active: u64,
    /// NAT sessions created since start
    pub nat_created: u64,
    /// Identification outcomes
    pub identification: IdentificationSnapshot,
    /// Plaintext bytes received from clients
    pub bytes_from_client: u64,
    /// Plaintext bytes sent to clients
    pub bytes_to_client: u64,
    /// Per-access-key counters, sorted by id
    pub keys: Vec<KeyStatsSnapshot>,
    /// Per-port counters, sorted by port
    pub ports: Vec<PortStatsSnapshot>,
    /// Timestamp in milliseconds
    pub timestamp_ms: u64,
}

/// Identification outcome counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentificationSnapshot {
    /// Successful identifications
    pub success: u64,
    /// Replayed salts
    pub replay: u64,
    /// Inputs no credential authenticated
    pub no_match: u64,
    /// Framing errors after a match
    pub decode_error: u64,
    /// Handshake deadline expirations
    pub timeout: u64,
}

/// Counters for one access key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStatsSnapshot {
    /// Access key id
    pub id: String,
    /// Finished TCP connections
    pub tcp_connections: u64,
    /// UDP packets from the client
    pub udp_packets: u64,
    /// Plaintext bytes received from the client
    pub bytes_from_client: u64,
    /// Plaintext bytes sent to the client
    pub bytes_to_client: u64,
}

/// Counters for one port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortStatsSnapshot {
    /// Port number
    pub port: u16,
    /// TCP connections accepted
    pub tcp_accepted: u64,
    /// Active TCP connections
    pub tcp_active: u64,
    /// Active NAT sessions
    pub nat_active: u64,
    /// Identification failures of any kind
    pub identification_failures: u64,
}

impl StatsSnapshot {
    /// Total plaintext bytes relayed (both directions)
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_from_client + self.bytes_to_client
    }

    /// Counters for one key, if it has any traffic
    #[must_use]
    pub fn key(&self, id: &str) -> Option<&KeyStatsSnapshot> {
        self.keys.iter().find(|k| k.id == id)
    }
}
