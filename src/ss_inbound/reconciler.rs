//! Port/credential reconciler
//!
//! The reconciler is the only owner of port bindings. Every operation takes
//! the same async mutex over the port map, so whole-config reloads and
//! management add/remove calls never race each other while binding or
//! closing a port.
//!
//! # Reload
//!
//! ```text
//! current ports  {9000, 9001}        config ports {9001, 9002}
//!        │                                  │
//!        └──────────── diff ────────────────┘
//!   close 9000     replace set on 9001     open 9002
//! ```
//!
//! Reconciliation is not atomic across ports: a port that fails to bind is
//! reported in `PartialReconcile` while every other transition still applies.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::context::RelayContext;
use super::error::{ShadowsocksInboundError, ShadowsocksInboundResult};
use super::port::PortBinding;
use crate::config::AccessKeyConfig;
use crate::shadowsocks::Credential;

/// Credentials to serve, keyed by port
pub type CredentialsByPort = BTreeMap<u16, Vec<Arc<Credential>>>;

/// Result of [`Reconciler::remove_credential`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    /// Whether the identity was served on the port
    pub existed: bool,
    /// Whether the port closed because its last key went away
    pub port_closed: bool,
}

/// An access key that was left out while grouping a configuration
#[derive(Debug)]
pub struct RejectedKey {
    /// Access key id
    pub id: String,
    /// Requested port
    pub port: u16,
    /// Why it was rejected
    pub reason: ShadowsocksInboundError,
}

/// Build per-port credential lists from access-key configs
///
/// Keys with an invalid cipher or secret, and keys whose id already appears
/// on the same port, are rejected individually; the rest are kept in
/// configuration order.
#[must_use]
pub fn group_access_keys(keys: &[AccessKeyConfig]) -> (CredentialsByPort, Vec<RejectedKey>) {
    let mut by_port = CredentialsByPort::new();
    let mut rejected = Vec::new();

    for key in keys {
        let credential = match Credential::from_cipher_name(&key.id, &key.cipher, &key.secret) {
            Ok(c) => c,
            Err(e) => {
                rejected.push(RejectedKey {
                    id: key.id.clone(),
                    port: key.port,
                    reason: e.into(),
                });
                continue;
            }
        };

        let list = by_port.entry(key.port).or_default();
        if list.iter().any(|c| c.identity() == key.id) {
            rejected.push(RejectedKey {
                id: key.id.clone(),
                port: key.port,
                reason: ShadowsocksInboundError::duplicate_identity(&key.id, key.port),
            });
            continue;
        }
        list.push(Arc::new(credential));
    }

    by_port.retain(|_, creds| !creds.is_empty());
    (by_port, rejected)
}

/// What a reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// Ports newly bound
    pub opened: Vec<u16>,
    /// Ports closed
    pub closed: Vec<u16>,
    /// Ports whose credential set was replaced
    pub updated: Vec<u16>,
    /// Ports left as they were
    pub unchanged: Vec<u16>,
    /// Access keys rejected before reconciliation
    pub rejected_keys: usize,
}

/// Per-port view used by status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortStatus {
    /// Port number
    pub port: u16,
    /// Access key ids in trial order
    pub keys: Vec<String>,
    /// Live NAT sessions
    pub nat_sessions: usize,
}

/// Owner of all port bindings
#[derive(Debug)]
pub struct Reconciler {
    ctx: Arc<RelayContext>,
    ports: Mutex<BTreeMap<u16, PortBinding>>,
    closed: AtomicBool,
}

impl Reconciler {
    /// Create a reconciler with no ports
    #[must_use]
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self {
            ctx,
            ports: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Shared relay context
    #[must_use]
    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    fn ensure_open(&self) -> ShadowsocksInboundResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ShadowsocksInboundError::ShuttingDown);
        }
        Ok(())
    }

    fn publish_counts(&self, ports: &BTreeMap<u16, PortBinding>) {
        let keys: usize = ports.values().map(|b| b.credentials().len()).sum();
        self.ctx.metrics.set_access_key_count(keys, ports.len());
    }

    /// Make the bound ports and their credential sets match `desired`
    ///
    /// Ports with an empty credential list are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns `PartialReconcile` listing every port whose transition failed.
    /// All other transitions have been applied. Returns `ShuttingDown` once
    /// the reconciler has been shut down.
    pub async fn reconcile(&self, mut desired: CredentialsByPort) -> ShadowsocksInboundResult<ReconcileSummary> {
        desired.retain(|_, creds| !creds.is_empty());

        let mut ports = self.ports.lock().await;
        self.ensure_open()?;
        let mut summary = ReconcileSummary::default();
        let mut failures = Vec::new();

        let to_close: Vec<u16> = ports
            .keys()
            .filter(|port| !desired.contains_key(port))
            .copied()
            .collect();
        for port in to_close {
            if let Some(binding) = ports.remove(&port) {
                binding.shutdown().await;
                summary.closed.push(port);
            }
        }

        for (port, creds) in desired {
            if let Some(binding) = ports.get(&port) {
                if *binding.credentials().snapshot() == creds {
                    summary.unchanged.push(port);
                    continue;
                }
                match binding.credentials().replace(creds) {
                    Ok(()) => summary.updated.push(port),
                    Err(e) => failures.push((port, e)),
                }
                continue;
            }

            match PortBinding::bind(self.ctx.settings.listen_ip, port, creds, Arc::clone(&self.ctx)) {
                Ok(binding) => {
                    ports.insert(port, binding);
                    summary.opened.push(port);
                }
                Err(e) => {
                    warn!(port, error = %e, "Failed to open port");
                    failures.push((port, e));
                }
            }
        }

        self.publish_counts(&ports);
        info!(
            ports = ports.len(),
            opened = summary.opened.len(),
            closed = summary.closed.len(),
            updated = summary.updated.len(),
            failed = failures.len(),
            "Reconciled ports"
        );

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(ShadowsocksInboundError::PartialReconcile { failures })
        }
    }

    /// Reconcile from access-key configuration
    ///
    /// Keys with a bad cipher, secret, or duplicate id are skipped with a
    /// warning and counted in `rejected_keys`; they never abort the reload.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::reconcile`].
    pub async fn reconcile_from_config(&self, keys: &[AccessKeyConfig]) -> ShadowsocksInboundResult<ReconcileSummary> {
        let (desired, rejected) = group_access_keys(keys);
        for key in &rejected {
            warn!(key = %key.id, port = key.port, error = %key.reason, "Skipping access key");
        }
        let mut summary = self.reconcile(desired).await?;
        summary.rejected_keys = rejected.len();
        info!(keys = keys.len() - rejected.len(), "Loaded access keys");
        Ok(summary)
    }

    /// Add a credential on `requested_port`, or on the next bindable port
    ///
    /// If the port is already served, the credential joins its set. Otherwise
    /// up to `port_scan_limit` consecutive ports are tried, skipping ports
    /// this relay already serves.
    ///
    /// Returns the port actually used.
    ///
    /// # Errors
    ///
    /// - `DuplicateIdentity` if the identity already exists on a served port
    /// - `PortUnavailable` if no port in the scan window could be bound
    /// - `ShuttingDown` after [`Reconciler::shutdown`]
    pub async fn add_credential(&self, credential: Credential, requested_port: u16) -> ShadowsocksInboundResult<u16> {
        let credential = Arc::new(credential);
        let mut ports = self.ports.lock().await;
        self.ensure_open()?;

        if let Some(binding) = ports.get(&requested_port) {
            binding.credentials().add(Arc::clone(&credential))?;
            self.publish_counts(&ports);
            info!(key = credential.identity(), port = requested_port, "Added access key");
            return Ok(requested_port);
        }

        let limit = self.ctx.settings.port_scan_limit.max(1);
        let last = requested_port.saturating_add(limit - 1);
        for port in requested_port..=last {
            if ports.contains_key(&port) {
                continue;
            }
            match PortBinding::bind(
                self.ctx.settings.listen_ip,
                port,
                vec![Arc::clone(&credential)],
                Arc::clone(&self.ctx),
            ) {
                Ok(binding) => {
                    let actual = binding.port();
                    ports.insert(actual, binding);
                    self.publish_counts(&ports);
                    if actual != requested_port {
                        warn!(requested = requested_port, actual, "Requested port unavailable, using another");
                    }
                    info!(key = credential.identity(), port = actual, "Added access key");
                    return Ok(actual);
                }
                Err(ShadowsocksInboundError::BindFailed { addr, reason }) => {
                    debug!(%addr, %reason, "Port unavailable, trying next");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ShadowsocksInboundError::PortUnavailable {
            first: requested_port,
            last,
        })
    }

    /// Remove `identity` from `port`, closing the port if it becomes empty
    ///
    /// Both facts in the returned [`Removal`] are taken under the port lock.
    ///
    /// # Errors
    ///
    /// Returns `PortNotFound` if the port is not served.
    pub async fn remove_credential(&self, identity: &str, port: u16) -> ShadowsocksInboundResult<Removal> {
        let mut ports = self.ports.lock().await;
        let binding = ports
            .get(&port)
            .ok_or(ShadowsocksInboundError::PortNotFound(port))?;

        let present = binding.credentials().contains(identity);
        let now_empty = binding.credentials().remove(identity);
        if present {
            info!(key = identity, port, "Removed access key");
        }
        let mut port_closed = false;
        if now_empty {
            if let Some(binding) = ports.remove(&port) {
                binding.shutdown().await;
                port_closed = true;
            }
        }
        self.publish_counts(&ports);
        Ok(Removal {
            existed: present,
            port_closed,
        })
    }

    /// Whether `identity` is served on `port`
    pub async fn is_credential_present(&self, identity: &str, port: u16) -> bool {
        self.ports
            .lock()
            .await
            .get(&port)
            .is_some_and(|b| b.credentials().contains(identity))
    }

    /// Bound ports in ascending order
    pub async fn ports(&self) -> Vec<u16> {
        self.ports.lock().await.keys().copied().collect()
    }

    /// Per-port status in ascending port order
    pub async fn status(&self) -> Vec<PortStatus> {
        self.ports
            .lock()
            .await
            .values()
            .map(|b| PortStatus {
                port: b.port(),
                keys: b.credentials().identities(),
                nat_sessions: b.nat_session_count(),
            })
            .collect()
    }

    /// Close every port; later reconciles and additions are refused
    pub async fn shutdown(&self) {
        let mut ports = self.ports.lock().await;
        self.closed.store(true, Ordering::Release);
        let bindings = std::mem::take(&mut *ports);
        for (_, binding) in bindings {
            binding.shutdown().await;
        }
        self.publish_counts(&ports);
        info!("All ports closed");
    }
}
