//! UDP relay: per-client NAT sessions and their idle expiry

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::UdpSocket;

use super::common::{
    credential, free_port, key, seal_datagram, udp_echo_server, udp_exchange, Harness,
};

#[tokio::test]
async fn test_datagrams_are_attributed_per_key() {
    let harness = Harness::new();
    let port = free_port();
    let echo = udp_echo_server().await;

    harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1"), key("b", port, "s2")])
        .await
        .unwrap();

    let client_a = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let client_b = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let cred_a = credential("a", "s1");
    let cred_b = credential("b", "s2");

    let reply = udp_exchange(&client_a, port, &cred_a, echo, b"from a").await;
    assert_eq!(reply.as_deref(), Some(&b"from a"[..]));
    let reply = udp_exchange(&client_b, port, &cred_b, echo, b"from b").await;
    assert_eq!(reply.as_deref(), Some(&b"from b"[..]));

    // A second packet reuses the session
    let reply = udp_exchange(&client_a, port, &cred_a, echo, b"again").await;
    assert_eq!(reply.as_deref(), Some(&b"again"[..]));

    let snap = harness.wait_for(|s| s.nat_created == 2).await;
    assert_eq!(snap.nat_created, 2);
    assert_eq!(snap.nat_active, 2);
    assert_eq!(snap.identification.success, 2);
    assert_eq!(snap.key("a").unwrap().udp_packets, 2);
    assert_eq!(snap.key("b").unwrap().udp_packets, 1);

    let status = harness.reconciler.status().await;
    assert_eq!(status[0].nat_sessions, 2);

    harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_unknown_key_datagram_is_dropped() {
    let harness = Harness::new();
    let port = free_port();
    let echo = udp_echo_server().await;

    harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1")])
        .await
        .unwrap();

    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let stranger = credential("c", "s3");
    assert!(udp_exchange(&client, port, &stranger, echo, b"ping").await.is_none());

    let snap = harness.wait_for(|s| s.identification.no_match == 1).await;
    assert_eq!(snap.identification.no_match, 1);
    assert_eq!(snap.nat_created, 0);

    harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_idle_session_expires_and_reidentifies() {
    let harness = Harness::with(0, Duration::from_millis(300));
    let port = free_port();
    let echo = udp_echo_server().await;

    harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1")])
        .await
        .unwrap();

    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let cred = credential("a", "s1");

    let reply = udp_exchange(&client, port, &cred, echo, b"first").await;
    assert_eq!(reply.as_deref(), Some(&b"first"[..]));
    assert_eq!(harness.snapshot().nat_active, 1);

    let snap = harness.wait_for(|s| s.nat_active == 0).await;
    assert_eq!(snap.nat_active, 0, "idle session should have expired");

    let reply = udp_exchange(&client, port, &cred, echo, b"second").await;
    assert_eq!(reply.as_deref(), Some(&b"second"[..]));

    let snap = harness.snapshot();
    assert_eq!(snap.nat_created, 2);
    assert_eq!(snap.identification.success, 2);

    harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_session_survives_key_removal_until_idle() {
    let harness = Harness::with(0, Duration::from_millis(300));
    let port = free_port();
    let echo = udp_echo_server().await;

    harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1"), key("b", port, "s2")])
        .await
        .unwrap();

    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let cred = credential("b", "s2");
    assert!(udp_exchange(&client, port, &cred, echo, b"one").await.is_some());

    harness.reconciler.remove_credential("b", port).await.unwrap();

    // The live session keeps the credential it was created with
    assert!(udp_exchange(&client, port, &cred, echo, b"two").await.is_some());

    harness.wait_for(|s| s.nat_active == 0).await;
    let packet = seal_datagram(&cred, echo, b"three");
    client
        .send_to(&packet, (Ipv4Addr::LOCALHOST, port))
        .await
        .unwrap();
    let snap = harness.wait_for(|s| s.identification.no_match == 1).await;
    assert_eq!(snap.identification.no_match, 1);

    harness.reconciler.shutdown().await;
}
