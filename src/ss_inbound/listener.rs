//! TCP relay service
//!
//! One service runs per port binding. Each accepted connection goes through:
//!
//! ```text
//! ACCEPT ──► IDENTIFY ──► CONNECT_UPSTREAM ──► RELAY ──► CLOSED
//!   │   (read deadline armed)    │                │
//!   │         │                  │                ├─ client ─decrypt─► target
//!   │         ▼                  ▼                └─ target ─encrypt─► client
//!   │   close silently     close, no retry
//! ```
//!
//! Identification failures close the socket without sending a byte, so a
//! prober cannot tell a wrong key from a replay or a short handshake.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use super::context::RelayContext;
use super::credentials::CredentialSet;
use super::error::{ShadowsocksInboundError, ShadowsocksInboundResult};
use super::identify::{identify_tcp, outcome_of, IdentifiedStream};
use crate::shadowsocks::{
    random_salt, AeadReader, AeadWriter, ShadowsocksDestination, ShadowsocksError, MAX_PAYLOAD_LEN,
};
use crate::stats::{CloseStatus, TransferBytes, Transport};

/// Back-off after a failed `accept` (e.g. file descriptor exhaustion)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop and per-connection relay for one port
pub struct TcpRelayService {
    listener: TcpListener,
    credentials: Arc<CredentialSet>,
    ctx: Arc<RelayContext>,
}

impl TcpRelayService {
    /// Create a service over an already bound listener
    pub fn new(listener: TcpListener, credentials: Arc<CredentialSet>, ctx: Arc<RelayContext>) -> Self {
        Self {
            listener,
            credentials,
            ctx,
        }
    }

    /// Local address of the listener
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> ShadowsocksInboundResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires
    ///
    /// On shutdown the listener is closed and every in-flight connection
    /// task is aborted, which drops (and so closes) its sockets.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let port = self.credentials.port();
        let mut connections = JoinSet::new();
        debug!(port, "TCP relay started");

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        trace!(port, peer = %peer, "Accepted TCP connection");
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.credentials),
                            Arc::clone(&self.ctx),
                        ));
                    }
                    Err(e) => {
                        warn!(port, error = %e, "TCP accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.recv() => break,
            }
        }

        drop(self.listener);
        let active = connections.len();
        connections.shutdown().await;
        debug!(port, aborted = active, "TCP relay stopped");
    }
}

impl std::fmt::Debug for TcpRelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpRelayService")
            .field("listener", &self.listener.local_addr().ok())
            .field("port", &self.credentials.port())
            .finish_non_exhaustive()
    }
}

/// How one connection ended
struct ConnectionReport {
    key: Option<String>,
    status: CloseStatus,
    bytes: TransferBytes,
}

impl ConnectionReport {
    fn failed(key: Option<&str>, status: CloseStatus) -> Self {
        Self {
            key: key.map(str::to_string),
            status,
            bytes: TransferBytes::default(),
        }
    }
}

/// Which side of the relay failed
enum RelayFailure {
    Client(ShadowsocksError),
    Target(std::io::Error),
}

async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    credentials: Arc<CredentialSet>,
    ctx: Arc<RelayContext>,
) {
    let guard = OpenConnection::new(Arc::clone(&ctx), credentials.port());
    let report = serve_connection(client, peer, &credentials, &ctx).await;
    guard.close(peer, report);
}

/// Reports the close of an accepted connection exactly once
///
/// A task aborted by port shutdown never reaches [`OpenConnection::close`];
/// the drop reports it as a client-side relay failure so active counts stay
/// balanced.
struct OpenConnection {
    ctx: Arc<RelayContext>,
    port: u16,
    started: Instant,
    closed: bool,
}

impl OpenConnection {
    fn new(ctx: Arc<RelayContext>, port: u16) -> Self {
        ctx.metrics.tcp_connection_opened(port);
        Self {
            ctx,
            port,
            started: Instant::now(),
            closed: false,
        }
    }

    fn close(mut self, peer: SocketAddr, report: ConnectionReport) {
        self.closed = true;
        let duration = self.started.elapsed();
        debug!(
            port = self.port,
            peer = %peer,
            key = report.key.as_deref().unwrap_or("-"),
            status = %report.status,
            client_to_target = report.bytes.client_to_target,
            target_to_client = report.bytes.target_to_client,
            duration_ms = duration.as_millis() as u64,
            "TCP connection closed"
        );
        self.ctx.metrics.tcp_connection_closed(
            self.port,
            report.key.as_deref(),
            report.status,
            report.bytes,
            duration,
        );
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.ctx.metrics.tcp_connection_closed(
                self.port,
                None,
                CloseStatus::ErrRelayClient,
                TransferBytes::default(),
                self.started.elapsed(),
            );
        }
    }
}

/// Read the target address and any data that followed it in the first chunk
async fn read_target(
    reader: &mut AeadReader<OwnedReadHalf>,
) -> ShadowsocksInboundResult<(ShadowsocksDestination, Vec<u8>)> {
    let first = reader
        .read_chunk()
        .await
        .map_err(|e| ShadowsocksInboundError::decode(e.to_string()))?
        .ok_or_else(|| ShadowsocksInboundError::decode("stream ended before target address"))?;
    let (target, used) = ShadowsocksDestination::parse(&first)
        .map_err(|e| ShadowsocksInboundError::decode(e.to_string()))?;
    Ok((target, first[used..].to_vec()))
}

async fn serve_connection(
    client: TcpStream,
    peer: SocketAddr,
    credentials: &CredentialSet,
    ctx: &RelayContext,
) -> ConnectionReport {
    let port = credentials.port();
    let _ = client.set_nodelay(true);
    let (client_read, client_write) = client.into_split();

    // IDENTIFY and read the target, both under one handshake deadline
    let deadline = Instant::now() + ctx.settings.tcp_read_timeout;
    let identified = timeout_at(deadline, identify_tcp(client_read, credentials, &ctx.replay))
        .await
        .unwrap_or(Err(ShadowsocksInboundError::HandshakeTimeout));
    let outcome = outcome_of(&identified);
    let IdentifiedStream {
        credential,
        mut reader,
    } = match identified {
        Ok(stream) => stream,
        Err(e) => {
            ctx.metrics.record_identification(port, Transport::Tcp, outcome);
            debug!(port, peer = %peer, error = %e, "TCP identification failed");
            return ConnectionReport::failed(None, CloseStatus::ErrCipher);
        }
    };
    let key = credential.identity();

    let target = timeout_at(deadline, read_target(&mut reader))
        .await
        .unwrap_or(Err(ShadowsocksInboundError::HandshakeTimeout));
    ctx.metrics
        .record_identification(port, Transport::Tcp, outcome_of(&target));
    let (target, initial) = match target {
        Ok(t) => t,
        Err(e) => {
            debug!(port, peer = %peer, key, error = %e, "Failed to read target address");
            return ConnectionReport::failed(Some(key), CloseStatus::ErrReadAddress);
        }
    };

    // CONNECT_UPSTREAM, never retried
    let upstream = match connect_upstream(&target, ctx).await {
        Ok(s) => s,
        Err(e) => {
            debug!(port, peer = %peer, key, target = %target, error = %e, "Upstream connect failed");
            return ConnectionReport::failed(Some(key), CloseStatus::ErrConnect);
        }
    };
    trace!(port, peer = %peer, key, target = %target, "Relaying");

    // Server salts are remembered so a client cannot reflect our stream back
    let salt = random_salt(credential.method());
    ctx.replay.check_and_record(&salt);
    let writer = match AeadWriter::new(client_write, credential.method(), credential.master_key(), salt) {
        Ok(w) => w,
        Err(e) => {
            warn!(port, key, error = %e, "Failed to set up response cipher");
            return ConnectionReport::failed(Some(key), CloseStatus::ErrRelayClient);
        }
    };

    // RELAY
    let client_to_target = AtomicU64::new(0);
    let target_to_client = AtomicU64::new(0);
    let result = relay(reader, writer, upstream, initial, &client_to_target, &target_to_client).await;
    let bytes = TransferBytes {
        client_to_target: client_to_target.load(Ordering::Relaxed),
        target_to_client: target_to_client.load(Ordering::Relaxed),
    };

    let status = match result {
        Ok(()) => CloseStatus::Ok,
        Err(RelayFailure::Client(e)) => {
            debug!(port, key, error = %e, "Client side of relay failed");
            CloseStatus::ErrRelayClient
        }
        Err(RelayFailure::Target(e)) => {
            debug!(port, key, error = %e, "Target side of relay failed");
            CloseStatus::ErrRelayTarget
        }
    };
    ConnectionReport {
        key: Some(key.to_string()),
        status,
        bytes,
    }
}

async fn connect_upstream(
    target: &ShadowsocksDestination,
    ctx: &RelayContext,
) -> ShadowsocksInboundResult<TcpStream> {
    let addr = ctx.settings.policy.resolve(target).await?;
    let stream = timeout(ctx.settings.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ShadowsocksInboundError::connect_failed(target, "timed out"))?
        .map_err(|e| ShadowsocksInboundError::connect_failed(target, e.to_string()))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Copy both directions until each has finished; the first error tears down both
async fn relay(
    mut reader: AeadReader<OwnedReadHalf>,
    mut writer: AeadWriter<OwnedWriteHalf>,
    upstream: TcpStream,
    initial: Vec<u8>,
    client_to_target: &AtomicU64,
    target_to_client: &AtomicU64,
) -> Result<(), RelayFailure> {
    let (mut up_read, mut up_write) = upstream.into_split();

    let uplink = async {
        if !initial.is_empty() {
            up_write.write_all(&initial).await.map_err(RelayFailure::Target)?;
            client_to_target.fetch_add(initial.len() as u64, Ordering::Relaxed);
        }
        while let Some(chunk) = reader.read_chunk().await.map_err(RelayFailure::Client)? {
            up_write.write_all(&chunk).await.map_err(RelayFailure::Target)?;
            client_to_target.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        // Client finished sending; half-close towards the target
        let _ = up_write.shutdown().await;
        Ok::<_, RelayFailure>(())
    };

    let downlink = async {
        let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
        loop {
            let n = up_read.read(&mut buf).await.map_err(RelayFailure::Target)?;
            if n == 0 {
                break;
            }
            writer.write_chunk(&buf[..n]).await.map_err(RelayFailure::Client)?;
            target_to_client.fetch_add(n as u64, Ordering::Relaxed);
        }
        let _ = writer.shutdown().await;
        Ok::<_, RelayFailure>(())
    };

    tokio::try_join!(uplink, downlink)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadowsocks::{Credential, ShadowsocksMethod};
    use crate::ss_inbound::context::RelaySettings;
    use crate::ss_inbound::policy::DestinationPolicy;
    use crate::stats::{NoopMetrics, RelayStats};

    fn context(stats: Arc<RelayStats>) -> Arc<RelayContext> {
        let settings = RelaySettings {
            tcp_read_timeout: Duration::from_millis(300),
            policy: DestinationPolicy::new(true),
            ..RelaySettings::default()
        };
        Arc::new(RelayContext::new(settings, 64, stats))
    }

    async fn start(
        ctx: Arc<RelayContext>,
        keys: &[(&str, &str)],
    ) -> (SocketAddr, broadcast::Sender<()>, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let set = Arc::new(CredentialSet::new(addr.port()));
        for (id, secret) in keys {
            set.add(Arc::new(Credential::new(*id, ShadowsocksMethod::default(), *secret).unwrap()))
                .unwrap();
        }
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(TcpRelayService::new(listener, set, ctx).run(rx));
        (addr, tx, handle)
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let stats = Arc::new(RelayStats::new());
        let (addr, _tx, _h) = start(context(Arc::clone(&stats)), &[("a", "s1")]).await;
        let echo = echo_server().await;
        let method = ShadowsocksMethod::default();
        let cred = Credential::new("a", method, "s1").unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        let mut writer = AeadWriter::new(w, method, cred.master_key(), random_salt(method)).unwrap();
        let mut first = Vec::new();
        ShadowsocksDestination::from(echo).write_to(&mut first).unwrap();
        first.extend_from_slice(b"ping");
        writer.write_chunk(&first).await.unwrap();

        let mut reader = AeadReader::from_salted(r, method, cred.master_key()).await.unwrap();
        assert_eq!(reader.read_chunk().await.unwrap().unwrap(), b"ping");

        writer.shutdown().await.unwrap();
        assert!(reader.read_chunk().await.unwrap().is_none());

        // the connection task records its close after the streams end
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.identification.success, 1);
        assert_eq!(snapshot.key("a").unwrap().bytes_from_client, 4);
    }

    #[tokio::test]
    async fn test_unknown_key_closed_without_response() {
        let stats = Arc::new(RelayStats::new());
        let (addr, _tx, _h) = start(context(Arc::clone(&stats)), &[("a", "s1")]).await;
        let method = ShadowsocksMethod::default();
        let stranger = Credential::new("z", method, "s3").unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut r, w) = stream.into_split();
        let mut writer = AeadWriter::new(w, method, stranger.master_key(), random_salt(method)).unwrap();
        writer.write_chunk(b"\x01\x7f\x00\x00\x01\x00\x50hello").await.unwrap();

        let mut buf = Vec::new();
        let n = r.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "no bytes may be sent on identification failure");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.snapshot().identification.no_match, 1);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let stats = Arc::new(RelayStats::new());
        let (addr, _tx, _h) = start(context(Arc::clone(&stats)), &[("a", "s1")]).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0u8; 10]).await.unwrap();
        let mut buf = Vec::new();
        let n = stream.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(stats.snapshot().identification.timeout, 1);
    }

    #[tokio::test]
    async fn test_bad_target_address_counts_as_decode_error() {
        let stats = Arc::new(RelayStats::new());
        let (addr, _tx, _h) = start(context(Arc::clone(&stats)), &[("a", "s1")]).await;
        let method = ShadowsocksMethod::default();
        let cred = Credential::new("a", method, "s1").unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut r, w) = stream.into_split();
        let mut writer = AeadWriter::new(w, method, cred.master_key(), random_salt(method)).unwrap();
        writer.write_chunk(b"\x09not-an-address").await.unwrap();

        let mut buf = Vec::new();
        let n = r.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.identification.decode_error, 1);
        assert_eq!(snapshot.identification.success, 0);
    }

    #[tokio::test]
    async fn test_one_deadline_covers_identification_and_target() {
        let stats = Arc::new(RelayStats::new());
        let settings = RelaySettings {
            tcp_read_timeout: Duration::from_millis(500),
            policy: DestinationPolicy::new(true),
            ..RelaySettings::default()
        };
        let ctx = Arc::new(RelayContext::new(settings, 64, stats.clone()));
        let (addr, _tx, _h) = start(ctx, &[("a", "s1")]).await;
        let method = ShadowsocksMethod::default();
        let cred = Credential::new("a", method, "s1").unwrap();

        // Salt and sealed length of a chunk whose payload never arrives
        let salt = random_salt(method);
        let mut cipher = cred.cipher(&salt).unwrap();
        let mut prefix = salt;
        cipher.seal_append(&32u16.to_be_bytes(), &mut prefix).unwrap();

        let started = Instant::now();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&prefix[..8]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        stream.write_all(&prefix[8..]).await.unwrap();

        let mut buf = Vec::new();
        let n = stream.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(
            started.elapsed() < Duration::from_millis(800),
            "handshake held for {:?}",
            started.elapsed()
        );
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.identification.timeout, 1);
        assert_eq!(snapshot.identification.success, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let ctx = Arc::new(RelayContext::new(RelaySettings::default(), 0, Arc::new(NoopMetrics)));
        let (addr, tx, handle) = start(ctx, &[("a", "s1")]).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
