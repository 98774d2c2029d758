//! Port bindings
//!
//! A port binding owns the TCP listener and the UDP socket of one port
//! number, the credential set both relay services read, and the tasks
//! running them. It exists only while both sockets are open.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::context::RelayContext;
use super::credentials::CredentialSet;
use super::error::{ShadowsocksInboundError, ShadowsocksInboundResult};
use super::listener::TcpRelayService;
use super::udp_relay::{NatTable, UdpRelayService};
use crate::shadowsocks::Credential;

/// Create a listening TCP socket.
///
/// `SO_REUSEADDR` lets a closed port be reopened while old connections sit
/// in `TIME_WAIT`. `SO_REUSEPORT` is deliberately not set so that a port
/// held by another process fails to bind.
fn bind_tcp(addr: SocketAddr, backlog: u32) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Create a UDP socket; no address reuse, so an occupied port fails to bind.
fn bind_udp(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Live TCP listener + UDP socket pair on one port
pub struct PortBinding {
    port: u16,
    local_addr: SocketAddr,
    credentials: Arc<CredentialSet>,
    nat: Arc<NatTable>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl PortBinding {
    /// Bind both sockets of `port` on `listen_ip` and start the relay services
    ///
    /// If either socket fails to bind, nothing stays open. Port 0 binds an
    /// ephemeral TCP port and the UDP socket on the same number.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - `BindFailed` if the TCP listener or the UDP socket cannot be bound
    /// - `DuplicateIdentity` if `credentials` repeats an identity
    pub fn bind(
        listen_ip: IpAddr,
        port: u16,
        credentials: Vec<Arc<Credential>>,
        ctx: Arc<RelayContext>,
    ) -> ShadowsocksInboundResult<Self> {
        let requested = SocketAddr::new(listen_ip, port);

        let std_listener = bind_tcp(requested, ctx.settings.tcp_backlog)
            .map_err(|e| ShadowsocksInboundError::bind_failed(requested, format!("tcp: {e}")))?;
        let local_addr = std_listener.local_addr()?;
        let std_socket = bind_udp(local_addr)
            .map_err(|e| ShadowsocksInboundError::bind_failed(local_addr, format!("udp: {e}")))?;

        let listener = TcpListener::from_std(std_listener)?;
        let socket = UdpSocket::from_std(std_socket)?;

        let set = Arc::new(CredentialSet::new(local_addr.port()));
        set.replace(credentials)?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let tcp = TcpRelayService::new(listener, Arc::clone(&set), Arc::clone(&ctx));
        let udp = UdpRelayService::new(socket, Arc::clone(&set), ctx);
        let nat = udp.nat_table();
        let tasks = vec![
            tokio::spawn(tcp.run(shutdown_tx.subscribe())),
            tokio::spawn(udp.run(shutdown_tx.subscribe())),
        ];

        info!(
            port = local_addr.port(),
            listen = %local_addr,
            keys = set.len(),
            "Port opened"
        );

        Ok(Self {
            port: local_addr.port(),
            local_addr,
            credentials: set,
            nat,
            shutdown_tx,
            tasks,
        })
    }

    /// Port number
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Address both sockets are bound to
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Credential set served on this port
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialSet> {
        &self.credentials
    }

    /// Live NAT sessions
    #[must_use]
    pub fn nat_session_count(&self) -> usize {
        self.nat.len()
    }

    /// Close both sockets and wait for every relay task to stop
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        drop(self.shutdown_tx);
        for task in self.tasks {
            if let Err(e) = task.await {
                debug!(port = self.port, error = %e, "Relay task ended abnormally");
            }
        }
        info!(port = self.port, "Port closed");
    }
}

impl std::fmt::Debug for PortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortBinding")
            .field("port", &self.port)
            .field("local_addr", &self.local_addr)
            .field("keys", &self.credentials.len())
            .field("nat_sessions", &self.nat.len())
            .finish_non_exhaustive()
    }
}
