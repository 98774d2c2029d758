//! TCP relay through a shared port: attribution, rejection and replay

use std::time::Duration;

use super::common::{
    credential, encode_request, free_port, key, read_exactly, send_raw, ss_connect,
    tcp_echo_server, Harness,
};

#[tokio::test]
async fn test_two_keys_on_one_port_are_told_apart() {
    let harness = Harness::new();
    let port = free_port();
    let echo = tcp_echo_server().await;

    let summary = harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1"), key("b", port, "s2")])
        .await
        .unwrap();
    assert_eq!(summary.opened, vec![port]);

    let status = harness.reconciler.status().await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].keys, vec!["a".to_string(), "b".to_string()]);

    for (id, secret) in [("a", "s1"), ("b", "s2")] {
        let cred = credential(id, secret);
        let (mut reader, mut writer) = ss_connect(port, &cred, echo, b"hello ").await;
        writer.write_chunk(b"world").await.unwrap();
        assert_eq!(read_exactly(&mut reader, 11).await, b"hello world");
        writer.shutdown().await.unwrap();
        drop(writer);
        drop(reader);
    }

    let snap = harness
        .wait_for(|s| {
            s.key("a").is_some_and(|k| k.tcp_connections == 1)
                && s.key("b").is_some_and(|k| k.tcp_connections == 1)
        })
        .await;
    assert_eq!(snap.identification.success, 2);
    assert_eq!(snap.identification.no_match, 0);
    assert_eq!(snap.key("a").unwrap().bytes_from_client, 11);

    harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_unknown_key_is_closed_without_reply() {
    let harness = Harness::new();
    let port = free_port();
    let echo = tcp_echo_server().await;

    harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1"), key("b", port, "s2")])
        .await
        .unwrap();

    let stranger = credential("c", "s3");
    let request = encode_request(&stranger, echo, b"ping").await;
    assert_eq!(send_raw(port, &request).await, 0);

    let snap = harness.wait_for(|s| s.identification.no_match == 1).await;
    assert_eq!(snap.identification.no_match, 1);
    assert_eq!(snap.identification.success, 0);

    harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_garbage_is_closed_without_reply() {
    let harness = Harness::new();
    let port = free_port();

    harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1")])
        .await
        .unwrap();

    assert_eq!(send_raw(port, &[0x42; 128]).await, 0);
    harness.wait_for(|s| s.identification.no_match == 1).await;

    harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_replayed_request_is_rejected() {
    let harness = Harness::with(1024, Duration::from_secs(300));
    let port = free_port();
    let echo = tcp_echo_server().await;

    harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1")])
        .await
        .unwrap();

    let cred = credential("a", "s1");
    let request = encode_request(&cred, echo, b"once").await;

    // The first use is relayed: the echo comes back encrypted
    let mut stream = tokio::net::TcpStream::connect((std::net::Ipv4Addr::LOCALHOST, port))
        .await
        .unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut stream, &request)
        .await
        .unwrap();
    let (r, _w) = stream.into_split();
    let mut reader = ss_relay::shadowsocks::AeadReader::from_salted(r, cred.method(), cred.master_key())
        .await
        .unwrap();
    assert_eq!(read_exactly(&mut reader, 4).await, b"once");

    // The identical bytes again carry a salt the relay has already seen
    assert_eq!(send_raw(port, &request).await, 0);

    let snap = harness.wait_for(|s| s.identification.replay == 1).await;
    assert_eq!(snap.identification.replay, 1);
    assert_eq!(snap.identification.success, 1);

    harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_removed_key_stops_matching_new_connections() {
    let harness = Harness::new();
    let port = free_port();
    let echo = tcp_echo_server().await;

    harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1"), key("b", port, "s2")])
        .await
        .unwrap();

    // Connection established before the removal keeps running
    let cred_b = credential("b", "s2");
    let (mut reader, mut writer) = ss_connect(port, &cred_b, echo, b"before").await;
    assert_eq!(read_exactly(&mut reader, 6).await, b"before");

    assert!(harness.reconciler.remove_credential("b", port).await.unwrap().existed);

    writer.write_chunk(b"after").await.unwrap();
    assert_eq!(read_exactly(&mut reader, 5).await, b"after");

    let request = encode_request(&cred_b, echo, b"late").await;
    assert_eq!(send_raw(port, &request).await, 0);
    harness.wait_for(|s| s.identification.no_match == 1).await;

    harness.reconciler.shutdown().await;
}
