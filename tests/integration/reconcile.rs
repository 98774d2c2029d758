//! Reconciliation of desired keys against live port bindings

use std::net::Ipv4Addr;

use ss_relay::ss_inbound::ShadowsocksInboundError;

use super::common::{credential, free_port, key, Harness};

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let harness = Harness::new();
    let (p1, p2) = (free_port(), free_port());
    let keys = vec![key("a", p1, "s1"), key("b", p1, "s2"), key("c", p2, "s3")];

    let first = harness.reconciler.reconcile_from_config(&keys).await.unwrap();
    let mut opened = first.opened.clone();
    opened.sort_unstable();
    let mut expected = vec![p1, p2];
    expected.sort_unstable();
    assert_eq!(opened, expected);

    let second = harness.reconciler.reconcile_from_config(&keys).await.unwrap();
    assert!(second.opened.is_empty());
    assert!(second.closed.is_empty());
    assert!(second.updated.is_empty());
    assert_eq!(second.unchanged.len(), 2);

    let snap = harness.snapshot();
    assert_eq!(snap.ports_bound, 2);
    assert_eq!(snap.access_keys, 3);

    harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_changed_secret_updates_port_in_place() {
    let harness = Harness::new();
    let port = free_port();

    harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1")])
        .await
        .unwrap();
    let summary = harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "rotated")])
        .await
        .unwrap();
    assert_eq!(summary.updated, vec![port]);
    assert!(summary.opened.is_empty());

    harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_empty_config_closes_every_port() {
    let harness = Harness::new();
    let (p1, p2) = (free_port(), free_port());

    harness
        .reconciler
        .reconcile_from_config(&[key("a", p1, "s1"), key("b", p2, "s2")])
        .await
        .unwrap();

    let summary = harness.reconciler.reconcile_from_config(&[]).await.unwrap();
    assert_eq!(summary.closed.len(), 2);
    assert!(harness.reconciler.ports().await.is_empty());

    // Both ports are free again
    for port in [p1, p2] {
        std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
        std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }
}

#[tokio::test]
async fn test_invalid_keys_are_skipped() {
    let harness = Harness::new();
    let port = free_port();
    let mut bad = key("bad", port, "s2");
    bad.cipher = "rc4-md5".into();

    let summary = harness
        .reconciler
        .reconcile_from_config(&[key("a", port, "s1"), bad, key("a", port, "dup")])
        .await
        .unwrap();
    assert_eq!(summary.rejected_keys, 2);
    assert!(harness.reconciler.is_credential_present("a", port).await);
    assert!(!harness.reconciler.is_credential_present("bad", port).await);

    harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_add_and_remove_access_key() {
    let harness = Harness::new();
    let port = free_port();

    let actual = harness
        .reconciler
        .add_credential(credential("a", "s1"), port)
        .await
        .unwrap();
    assert_eq!(actual, port);
    assert!(harness.reconciler.is_credential_present("a", port).await);

    let err = harness
        .reconciler
        .add_credential(credential("a", "other"), port)
        .await
        .unwrap_err();
    assert!(matches!(err, ShadowsocksInboundError::DuplicateIdentity { .. }));

    let removal = harness.reconciler.remove_credential("a", port).await.unwrap();
    assert!(removal.existed);
    assert!(removal.port_closed);
    assert!(!harness.reconciler.is_credential_present("a", port).await);
    assert!(harness.reconciler.ports().await.is_empty());

    let err = harness
        .reconciler
        .remove_credential("a", port)
        .await
        .unwrap_err();
    assert!(matches!(err, ShadowsocksInboundError::PortNotFound(p) if p == port));
}

#[tokio::test]
async fn test_add_moves_past_port_in_use() {
    let harness = Harness::new();
    let busy = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let busy_port = busy.local_addr().unwrap().port();

    match harness
        .reconciler
        .add_credential(credential("a", "s1"), busy_port)
        .await
    {
        Ok(actual) => {
            assert_ne!(actual, busy_port);
            assert!(harness.reconciler.is_credential_present("a", actual).await);
        }
        // Every port in the scan window happened to be taken
        Err(e) => assert!(matches!(e, ShadowsocksInboundError::PortUnavailable { .. })),
    }

    harness.reconciler.shutdown().await;
}
