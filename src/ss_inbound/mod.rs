//! Multi-tenant Shadowsocks inbound
//!
//! Serves any number of access keys across any number of ports. Each port
//! holds a TCP listener and a UDP socket sharing one credential set; an
//! incoming connection or NAT session is attributed to a key by trial
//! decryption against that set.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                          Reconciler                                |
//! |   config / IPC  ──>  diff ports  ──>  open / update / close        |
//! |                                                                    |
//! |   +--------------------------+   +--------------------------+      |
//! |   | PortBinding :9000        |   | PortBinding :9001        | ...  |
//! |   |  CredentialSet (ArcSwap) |   |  CredentialSet (ArcSwap) |      |
//! |   |  TcpRelayService         |   |  TcpRelayService         |      |
//! |   |  UdpRelayService + NAT   |   |  UdpRelayService + NAT   |      |
//! |   +--------------------------+   +--------------------------+      |
//! |                                                                    |
//! |   RelayContext: settings, ReplayCache, RelayMetrics (shared)       |
//! +--------------------------------------------------------------------+
//! ```
//!
//! # Connection Flow
//!
//! 1. **Identify**: read the salt and first length block, reject replayed
//!    salts, then trial-decrypt against the port's current snapshot
//! 2. **Target**: read the SOCKS-style address from the first chunk
//! 3. **Policy**: refuse non-public destinations unless configured otherwise
//! 4. **Relay**: copy both directions, sealing replies under a fresh salt
//!
//! Identification failures are never answered: the TCP connection is closed
//! with no bytes sent and the UDP packet is dropped.

pub mod context;
pub mod credentials;
pub mod error;
pub mod identify;
pub mod listener;
pub mod policy;
pub mod port;
pub mod reconciler;
pub mod replay;
pub mod udp_relay;

pub use context::{RelayContext, RelaySettings};
pub use credentials::{CredentialSet, CredentialSnapshot, TrialResult};
pub use error::{ShadowsocksInboundError, ShadowsocksInboundResult};
pub use identify::{identify_tcp, identify_udp, IdentifiedPacket, IdentifiedStream};
pub use listener::TcpRelayService;
pub use policy::{is_non_public, DestinationPolicy};
pub use port::PortBinding;
pub use reconciler::{group_access_keys, CredentialsByPort, PortStatus, ReconcileSummary, Reconciler, Removal};
pub use replay::ReplayCache;
pub use udp_relay::{NatSession, NatTable, UdpRelayService};
