//! Shared fixtures: a relay harness, echo servers, and a minimal
//! shadowsocks client built on the crate's own framing types.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use ss_relay::config::AccessKeyConfig;
use ss_relay::shadowsocks::{
    encode_datagram, random_salt, AeadReader, AeadWriter, Credential, ShadowsocksDestination,
    ShadowsocksMethod,
};
use ss_relay::ss_inbound::{DestinationPolicy, Reconciler, RelayContext, RelaySettings};
use ss_relay::stats::{RelayMetrics, RelayStats, StatsSnapshot};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const CIPHER: &str = "chacha20-ietf-poly1305";

/// Reconciler on loopback with statistics attached
pub struct Harness {
    pub stats: Arc<RelayStats>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(0, Duration::from_secs(300))
    }

    pub fn with(replay_history: usize, nat_timeout: Duration) -> Self {
        let stats = Arc::new(RelayStats::new());
        let metrics: Arc<dyn RelayMetrics> = stats.clone();
        let settings = RelaySettings {
            listen_ip: LOCALHOST,
            tcp_read_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            nat_timeout,
            policy: DestinationPolicy::new(true),
            ..RelaySettings::default()
        };
        let ctx = RelayContext::new(settings, replay_history, metrics);
        Self {
            stats,
            reconciler: Arc::new(Reconciler::new(Arc::new(ctx))),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Poll statistics until `cond` holds or two seconds pass
    pub async fn wait_for(&self, cond: impl Fn(&StatsSnapshot) -> bool) -> StatsSnapshot {
        for _ in 0..100 {
            let snap = self.snapshot();
            if cond(&snap) {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.snapshot()
    }
}

/// A port nobody is using right now
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn key(id: &str, port: u16, secret: &str) -> AccessKeyConfig {
    AccessKeyConfig {
        id: id.into(),
        port,
        cipher: CIPHER.into(),
        secret: secret.into(),
    }
}

pub fn credential(id: &str, secret: &str) -> Credential {
    Credential::new(id, ShadowsocksMethod::Chacha20IetfPoly1305, secret).unwrap()
}

/// TCP server that echoes every connection back
pub async fn tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
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

/// UDP server that echoes every datagram back to its sender
pub async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

/// Client-side encoding of a TCP request: salt, target address, payload
pub async fn encode_request(cred: &Credential, target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut first = Vec::new();
    ShadowsocksDestination::from(target).write_to(&mut first).unwrap();
    first.extend_from_slice(payload);

    let salt = random_salt(cred.method());
    let mut writer = AeadWriter::new(Vec::new(), cred.method(), cred.master_key(), salt).unwrap();
    writer.write_chunk(&first).await.unwrap();
    writer.into_inner()
}

/// Open a shadowsocks TCP session through the relay and send `payload`
pub async fn ss_connect(
    relay_port: u16,
    cred: &Credential,
    target: SocketAddr,
    payload: &[u8],
) -> (AeadReader<OwnedReadHalf>, AeadWriter<OwnedWriteHalf>) {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, relay_port)).await.unwrap();
    let (r, w) = stream.into_split();

    let salt = random_salt(cred.method());
    let mut writer = AeadWriter::new(w, cred.method(), cred.master_key(), salt).unwrap();
    let mut first = Vec::new();
    ShadowsocksDestination::from(target).write_to(&mut first).unwrap();
    first.extend_from_slice(payload);
    writer.write_chunk(&first).await.unwrap();

    let reader = AeadReader::from_salted(r, cred.method(), cred.master_key())
        .await
        .unwrap();
    (reader, writer)
}

/// Read decrypted chunks until `len` bytes have arrived
pub async fn read_exactly(reader: &mut AeadReader<OwnedReadHalf>, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        let chunk = tokio::time::timeout(Duration::from_secs(2), reader.read_chunk())
            .await
            .expect("relay reply timed out")
            .unwrap()
            .expect("stream ended early");
        out.extend_from_slice(&chunk);
    }
    out
}

/// Send raw bytes and report how many bytes came back before the relay closed
pub async fn send_raw(relay_port: u16, bytes: &[u8]) -> usize {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, relay_port)).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    let mut buf = [0u8; 1024];
    let mut received = 0;
    loop {
        match tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return received,
            Ok(Ok(n)) => received += n,
            Err(_) => panic!("relay kept the connection open"),
        }
    }
}

/// Seal one UDP datagram for `target`
pub fn seal_datagram(cred: &Credential, target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let plaintext = encode_datagram(&ShadowsocksDestination::from(target), payload).unwrap();
    cred.seal_packet(&plaintext).unwrap()
}

/// Send one datagram through the relay and return the decrypted reply payload
pub async fn udp_exchange(
    client: &UdpSocket,
    relay_port: u16,
    cred: &Credential,
    target: SocketAddr,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let packet = seal_datagram(cred, target, payload);
    client
        .send_to(&packet, (Ipv4Addr::LOCALHOST, relay_port))
        .await
        .unwrap();

    let mut buf = vec![0u8; 65536];
    let (n, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
        .await
        .ok()?
        .unwrap();
    let plaintext = cred.open_packet(&buf[..n]).unwrap();
    let (source, used) = ShadowsocksDestination::parse(&plaintext).unwrap();
    assert_eq!(source.as_socket_addr(), Some(target));
    Some(plaintext[used..].to_vec())
}
