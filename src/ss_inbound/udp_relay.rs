//! UDP relay service
//!
//! One service runs per port binding. Packets are grouped into NAT sessions
//! keyed by client address:
//!
//! ```text
//! client ──sealed──► port socket ──► NAT table ──► session upstream socket ──► target
//!                                    (by client)         │
//! client ◄─sealed── port socket ◄─────────────── session task ◄─────────────── target
//! ```
//!
//! # Wire Format
//!
//! Every packet carries its own salt; the sealed body is the target (or, on
//! replies, the source) address followed by the payload.
//!
//! Only the first packet of a session goes through trial decryption. Later
//! packets are opened with the session's credential and silently dropped if
//! that fails. A session is removed once it has been idle in both
//! directions for the NAT timeout.
//!
//! Each session sends through one dual-stack upstream socket, so a client
//! may address IPv4 and IPv6 targets alike. Hosts without IPv6 get an IPv4
//! socket instead.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::context::RelayContext;
use super::credentials::CredentialSet;
use super::error::ShadowsocksInboundResult;
use super::identify::{identify_udp, outcome_of, IdentifiedPacket};
use crate::shadowsocks::{decode_datagram, encode_datagram, Credential, ShadowsocksDestination};
use crate::stats::Transport;

/// Maximum UDP packet buffer size
pub const MAX_UDP_BUFFER_SIZE: usize = 65536;

/// Client-to-upstream mapping for one client address
#[derive(Debug)]
pub struct NatSession {
    client_addr: SocketAddr,
    credential: Arc<Credential>,
    upstream: UdpSocket,
    dual_stack: bool,
    last_activity: Mutex<Instant>,
}

impl NatSession {
    fn new(client_addr: SocketAddr, credential: Arc<Credential>, upstream: UdpSocket) -> Self {
        let dual_stack = upstream.local_addr().is_ok_and(|addr| addr.is_ipv6());
        Self {
            client_addr,
            credential,
            upstream,
            dual_stack,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Client address
    #[must_use]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Credential identified on the first packet
    #[must_use]
    pub fn credential(&self) -> &Arc<Credential> {
        &self.credential
    }

    /// Reset the idle timer
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last packet in either direction
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// NAT sessions of one UDP relay service
#[derive(Debug, Default)]
pub struct NatTable {
    sessions: Mutex<HashMap<SocketAddr, Arc<NatSession>>>,
}

impl NatTable {
    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether there are no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Whether a session exists for `client`
    #[must_use]
    pub fn contains(&self, client: &SocketAddr) -> bool {
        self.sessions.lock().contains_key(client)
    }

    fn get(&self, client: &SocketAddr) -> Option<Arc<NatSession>> {
        self.sessions.lock().get(client).cloned()
    }

    fn insert(&self, session: Arc<NatSession>) {
        self.sessions.lock().insert(session.client_addr, session);
    }

    /// Remove `session` if it is still the entry for its client and has
    /// been idle for at least `idle_timeout`
    fn remove_if_idle(&self, session: &Arc<NatSession>, idle_timeout: Duration) -> bool {
        let mut sessions = self.sessions.lock();
        if session.idle_for() < idle_timeout {
            return false;
        }
        if sessions
            .get(&session.client_addr)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&session.client_addr);
        }
        true
    }

    fn drain(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let n = sessions.len();
        sessions.clear();
        n
    }
}

/// Receive loop and NAT sessions for one port
pub struct UdpRelayService {
    socket: Arc<UdpSocket>,
    credentials: Arc<CredentialSet>,
    ctx: Arc<RelayContext>,
    nat: Arc<NatTable>,
}

impl UdpRelayService {
    /// Create a service over an already bound socket
    pub fn new(socket: UdpSocket, credentials: Arc<CredentialSet>, ctx: Arc<RelayContext>) -> Self {
        Self {
            socket: Arc::new(socket),
            credentials,
            ctx,
            nat: Arc::new(NatTable::default()),
        }
    }

    /// NAT table shared with the port binding
    #[must_use]
    pub fn nat_table(&self) -> Arc<NatTable> {
        Arc::clone(&self.nat)
    }

    /// Local address of the socket
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> ShadowsocksInboundResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive packets until `shutdown` fires
    ///
    /// On shutdown every session task is aborted and the NAT table cleared.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let port = self.credentials.port();
        let mut tasks = JoinSet::new();
        let mut buf = vec![0u8; MAX_UDP_BUFFER_SIZE];
        debug!(port, "UDP relay started");

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((n, client)) => self.handle_packet(&buf[..n], client, &mut tasks).await,
                    Err(e) => warn!(port, error = %e, "UDP receive failed"),
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown.recv() => break,
            }
        }

        tasks.shutdown().await;
        let removed = self.nat.drain();
        for _ in 0..removed {
            self.ctx.metrics.nat_entry_removed(port);
        }
        debug!(port, sessions = removed, "UDP relay stopped");
    }

    async fn handle_packet(&self, packet: &[u8], client: SocketAddr, tasks: &mut JoinSet<()>) {
        let port = self.credentials.port();

        let (session, target, payload) = if let Some(session) = self.nat.get(&client) {
            let plaintext = match session.credential.open_packet(packet) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    trace!(port, client = %client, error = %e, "Dropping packet not sealed with session key");
                    return;
                }
            };
            match decode_datagram(&plaintext) {
                Ok((target, payload)) => (session, target, payload.to_vec()),
                Err(e) => {
                    debug!(port, client = %client, error = %e, "Bad UDP target address");
                    return;
                }
            }
        } else {
            let result = identify_udp(packet, &self.credentials, &self.ctx.replay);
            self.ctx
                .metrics
                .record_identification(port, Transport::Udp, outcome_of(&result));
            let IdentifiedPacket {
                credential,
                target,
                payload,
            } = match result {
                Ok(found) => found,
                Err(e) => {
                    debug!(port, client = %client, error = %e, "UDP identification failed");
                    return;
                }
            };

            let upstream = match bind_upstream() {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(port, error = %e, "Failed to open upstream UDP socket");
                    return;
                }
            };

            let session = Arc::new(NatSession::new(client, credential, upstream));
            self.nat.insert(Arc::clone(&session));
            self.ctx.metrics.nat_entry_added(port);
            debug!(port, client = %client, key = session.credential.identity(), "NAT session created");

            tasks.spawn(session_loop(
                Arc::clone(&session),
                Arc::clone(&self.socket),
                Arc::clone(&self.nat),
                Arc::clone(&self.ctx),
                port,
            ));
            (session, target, payload)
        };

        session.touch();
        self.ctx
            .metrics
            .udp_packet_from_client(port, session.credential.identity(), payload.len());

        match target {
            ShadowsocksDestination::SocketAddr(addr) => {
                forward(&session, addr, &payload, &self.ctx, port).await;
            }
            ShadowsocksDestination::DomainName { .. } => {
                // Resolution may be slow; keep the receive loop going
                let ctx = Arc::clone(&self.ctx);
                tasks.spawn(async move {
                    match ctx.settings.policy.resolve(&target).await {
                        Ok(addr) => forward(&session, addr, &payload, &ctx, port).await,
                        Err(e) => debug!(port, target = %target, error = %e, "UDP target refused"),
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for UdpRelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpRelayService")
            .field("socket", &self.socket.local_addr().ok())
            .field("sessions", &self.nat.len())
            .finish_non_exhaustive()
    }
}

/// Open a session's upstream socket, dual-stack where the host allows it
fn bind_upstream() -> io::Result<UdpSocket> {
    let socket = match bind_dual_stack() {
        Ok(socket) => socket,
        Err(e) => {
            trace!(error = %e, "No dual-stack UDP socket, falling back to IPv4");
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
            socket
        }
    };
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn bind_dual_stack() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)).into())?;
    Ok(socket)
}

/// Address to pass to `send_to` on the session's upstream socket
fn upstream_addr(addr: SocketAddr, dual_stack: bool) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if dual_stack => {
            SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
        }
        other => other,
    }
}

/// Source address as the client should see it
fn unmap_source(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

async fn forward(session: &NatSession, addr: SocketAddr, payload: &[u8], ctx: &RelayContext, port: u16) {
    if let Err(e) = ctx.settings.policy.check(addr) {
        debug!(port, client = %session.client_addr, error = %e, "UDP target refused");
        return;
    }
    let send_to = upstream_addr(addr, session.dual_stack);
    if let Err(e) = session.upstream.send_to(payload, send_to).await {
        debug!(port, target = %addr, error = %e, "UDP send to target failed");
    }
}

/// Relay replies from the session's upstream socket until the session idles out
async fn session_loop(
    session: Arc<NatSession>,
    socket: Arc<UdpSocket>,
    nat: Arc<NatTable>,
    ctx: Arc<RelayContext>,
    port: u16,
) {
    let idle_timeout = ctx.settings.nat_timeout;
    let key = session.credential.identity();
    let mut buf = vec![0u8; MAX_UDP_BUFFER_SIZE];

    loop {
        let idle = session.idle_for();
        if idle >= idle_timeout {
            if nat.remove_if_idle(&session, idle_timeout) {
                break;
            }
            continue;
        }

        let (n, source) = match timeout(idle_timeout - idle, session.upstream.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                trace!(port, client = %session.client_addr, error = %e, "Upstream UDP receive failed");
                continue;
            }
        };
        session.touch();

        let source = unmap_source(source);
        let reply = encode_datagram(&ShadowsocksDestination::from(source), &buf[..n])
            .and_then(|plaintext| session.credential.seal_packet(&plaintext));
        let reply = match reply {
            Ok(r) => r,
            Err(e) => {
                warn!(port, key, error = %e, "Failed to seal UDP reply");
                continue;
            }
        };
        match socket.send_to(&reply, session.client_addr).await {
            Ok(_) => ctx.metrics.udp_packet_from_target(port, key, n),
            Err(e) => debug!(port, client = %session.client_addr, error = %e, "UDP send to client failed"),
        }
    }

    ctx.metrics.nat_entry_removed(port);
    debug!(port, client = %session.client_addr, key, "NAT session expired");
}
