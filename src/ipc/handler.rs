//! IPC command handler
//!
//! This module processes IPC commands and generates responses. It is also
//! the single place configuration reloads go through, so SIGHUP and the
//! `reload` command behave identically.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::protocol::{ErrorCode, IpcCommand, IpcResponse, ServerStatus};
use crate::config::load_config_with_env;
use crate::error::{ConfigError, SsRelayError};
use crate::shadowsocks::{Credential, ShadowsocksMethod};
use crate::ss_inbound::{ReconcileSummary, Reconciler, ShadowsocksInboundError};
use crate::stats::RelayStats;

/// Deadline for the `check_port` probe
const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// IPC command handler
pub struct IpcHandler {
    /// Port and credential owner
    reconciler: Arc<Reconciler>,

    /// Relay statistics
    stats: Arc<RelayStats>,

    /// Configuration file used when `reload` names none
    config_path: Option<PathBuf>,

    /// Process-wide shutdown signal
    shutdown_tx: broadcast::Sender<()>,

    /// Set once shutdown has been requested
    shutting_down: AtomicBool,

    /// Server start time
    start_time: Instant,

    /// Server version
    version: String,

    /// Last successful reload timestamp (Unix epoch milliseconds)
    last_reload_timestamp: AtomicU64,
}

impl IpcHandler {
    /// Create a new IPC handler
    pub fn new(
        reconciler: Arc<Reconciler>,
        stats: Arc<RelayStats>,
        config_path: Option<PathBuf>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            reconciler,
            stats,
            config_path,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            last_reload_timestamp: AtomicU64::new(0),
        }
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Handle an IPC command and return a response
    pub async fn handle(&self, command: IpcCommand) -> IpcResponse {
        debug!(command = command.name(), "Handling IPC command");

        match command {
            IpcCommand::Ping => IpcResponse::Pong,

            IpcCommand::Status => self.handle_status().await,

            IpcCommand::GetStats => IpcResponse::Stats(self.stats.snapshot()),

            IpcCommand::ListPorts => IpcResponse::PortList {
                ports: self.reconciler.status().await,
            },

            IpcCommand::AddAccessKey {
                id,
                port,
                cipher,
                secret,
            } => self.handle_add_access_key(id, port, cipher, secret).await,

            IpcCommand::RemoveAccessKey { id, port } => {
                self.handle_remove_access_key(id, port).await
            }

            IpcCommand::AccessKeyStatus { id, port } => {
                let active = self.reconciler.is_credential_present(&id, port).await;
                IpcResponse::AccessKeyStatus { id, port, active }
            }

            IpcCommand::CheckPort { port } => IpcResponse::PortCheck {
                port,
                accepting: check_port(port).await,
            },

            IpcCommand::Reload { config_path } => self.handle_reload(config_path).await,

            IpcCommand::Shutdown => self.handle_shutdown(),
        }
    }

    /// Handle status command
    async fn handle_status(&self) -> IpcResponse {
        let ports = self.reconciler.status().await;

        IpcResponse::Status(ServerStatus {
            version: self.version.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            ports: ports.len(),
            access_keys: ports.iter().map(|p| p.keys.len()).sum(),
            active_connections: self.stats.tcp_active(),
            nat_sessions: self.stats.nat_active(),
            replay_history: self.reconciler.context().replay.capacity(),
            last_reload_ms: self.last_reload_timestamp.load(Ordering::Relaxed),
            shutting_down: self.is_shutting_down(),
        })
    }

    /// Handle add access key command
    async fn handle_add_access_key(
        &self,
        id: String,
        port: u16,
        cipher: Option<String>,
        secret: String,
    ) -> IpcResponse {
        if port == 0 {
            return IpcResponse::error(ErrorCode::InvalidParameters, "port must be non-zero");
        }

        let method = cipher.unwrap_or_else(|| ShadowsocksMethod::default().as_str().to_string());
        let credential = match Credential::from_cipher_name(&id, &method, &secret) {
            Ok(c) => c,
            Err(e) => return IpcResponse::error(ErrorCode::InvalidParameters, e.to_string()),
        };

        match self.reconciler.add_credential(credential, port).await {
            Ok(actual) => IpcResponse::AccessKeyAdded { id, port: actual },
            Err(e) => {
                warn!(key = %id, port, error = %e, "Failed to add access key");
                inbound_error_response(&e)
            }
        }
    }

    /// Handle remove access key command
    async fn handle_remove_access_key(&self, id: String, port: u16) -> IpcResponse {
        match self.reconciler.remove_credential(&id, port).await {
            Ok(removal) => IpcResponse::AccessKeyRemoved {
                id,
                port,
                existed: removal.existed,
                port_closed: removal.port_closed,
            },
            Err(e) => inbound_error_response(&e),
        }
    }

    /// Reload access keys from `path`, or from the startup configuration file
    ///
    /// Server, IPC, and log settings are fixed at startup; only the key set
    /// is reconciled.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is known, the file does not load, or any
    /// port fails to transition. Transitions of other ports remain applied.
    pub async fn reload(&self, path: Option<&Path>) -> Result<ReconcileSummary, SsRelayError> {
        let path = path.or(self.config_path.as_deref()).ok_or_else(|| {
            ConfigError::validation("no configuration path given and none used at startup")
        })?;

        info!("Reloading configuration from {:?}", path);
        let config = load_config_with_env(path)?;
        let summary = self.reconciler.reconcile_from_config(&config.keys).await?;

        self.last_reload_timestamp
            .store(now_millis(), Ordering::Relaxed);
        Ok(summary)
    }

    /// Handle reload command
    async fn handle_reload(&self, config_path: Option<String>) -> IpcResponse {
        match self.reload(config_path.as_deref().map(Path::new)).await {
            Ok(summary) => IpcResponse::Reloaded(summary),
            Err(SsRelayError::Inbound(e)) => {
                warn!(error = %e, "Reload incomplete");
                inbound_error_response(&e)
            }
            Err(e) => {
                warn!(error = %e, "Failed to reload configuration");
                IpcResponse::error(
                    ErrorCode::OperationFailed,
                    format!("Failed to load configuration: {e}"),
                )
            }
        }
    }

    /// Handle shutdown command
    ///
    /// The response is sent before the ports are closed.
    fn handle_shutdown(&self) -> IpcResponse {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return IpcResponse::error(ErrorCode::ShuttingDown, "Shutdown already in progress");
        }
        info!("Shutdown requested via IPC");
        let _ = self.shutdown_tx.send(());
        IpcResponse::success_with_message("Shutdown initiated")
    }
}

impl std::fmt::Debug for IpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcHandler")
            .field("config_path", &self.config_path)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

/// Map a relay error to an IPC error response
fn inbound_error_response(e: &ShadowsocksInboundError) -> IpcResponse {
    let code = match e {
        ShadowsocksInboundError::DuplicateIdentity { .. } => ErrorCode::AlreadyExists,
        ShadowsocksInboundError::PortNotFound(_) => ErrorCode::NotFound,
        ShadowsocksInboundError::Shadowsocks(inner) if inner.is_config_error() => {
            ErrorCode::InvalidParameters
        }
        ShadowsocksInboundError::ShuttingDown => ErrorCode::ShuttingDown,
        ShadowsocksInboundError::PortUnavailable { .. }
        | ShadowsocksInboundError::BindFailed { .. } => ErrorCode::OperationFailed,
        ShadowsocksInboundError::PartialReconcile { failures } => {
            let detail: Vec<String> = failures
                .iter()
                .map(|(port, err)| format!("{port}: {err}"))
                .collect();
            return IpcResponse::error(
                ErrorCode::OperationFailed,
                format!("{e} ({})", detail.join("; ")),
            );
        }
        _ => ErrorCode::InternalError,
    };
    IpcResponse::error(code, e.to_string())
}

/// Whether something accepts TCP connections on localhost:`port`
async fn check_port(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match tokio::time::timeout(PORT_CHECK_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(port, error = %e, "Port check failed");
            false
        }
        Err(_) => false,
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
