//! ss-relay: Multi-tenant, multi-port Shadowsocks relay
//!
//! This crate serves many independently keyed Shadowsocks AEAD clients on
//! any number of ports. Access keys are attributed per connection by trial
//! decryption, and the set of keys and ports can be changed at runtime from
//! a configuration reload or the IPC management interface.
//!
//! # Architecture
//!
//! ```text
//! Client ──AEAD──> PortBinding (TCP + UDP) ──identify──> Relay ──> Destination
//!                        ↑                       ↑
//!                   Reconciler             CredentialSet
//!                   ↑        ↑                   ↑
//!              config     IPC commands      ReplayCache
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ss_relay::config::load_config;
//! use ss_relay::ss_inbound::{Reconciler, RelayContext};
//! use ss_relay::stats::RelayStats;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/ss-relay/config.json")?;
//!
//! let stats = Arc::new(RelayStats::new());
//! let ctx = RelayContext::from_config(&config.server, stats);
//! let reconciler = Reconciler::new(Arc::new(ctx));
//!
//! // Open every configured port
//! reconciler.reconcile_from_config(&config.keys).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Top-level error types
//! - [`ipc`]: IPC server, client, and protocol
//! - [`shadowsocks`]: Ciphers, credentials, and AEAD framing
//! - [`ss_inbound`]: Port bindings, identification, relays, and the reconciler
//! - [`stats`]: Relay metrics

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod ipc;
pub mod shadowsocks;
pub mod ss_inbound;
pub mod stats;

// Re-export commonly used types at the crate root
pub use config::{AccessKeyConfig, ServerConfig, SsRelayConfig};
pub use error::{ConfigError, IpcError, SsRelayError};
pub use ipc::{IpcClient, IpcCommand, IpcResponse, IpcServer};
pub use shadowsocks::{Credential, ShadowsocksError, ShadowsocksMethod};
pub use ss_inbound::{Reconciler, RelayContext, ShadowsocksInboundError};
pub use stats::{RelayMetrics, RelayStats, StatsSnapshot};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
