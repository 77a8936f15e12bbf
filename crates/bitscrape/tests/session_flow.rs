//! Session-level wiring: an inbound get_peers query must turn into a
//! stored infohash and a metadata fetch, bounded by the fetch cap, and
//! shutdown must leave a loadable routing-table snapshot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_bytes::ByteBuf;
use tokio::net::UdpSocket;

use bitscrape::{JsonlStorage, NullStorage, Session, SessionConfig};
use bitscrape_dht::krpc::{serialize_message, GetPeersRequest, Message, MessageKind};
use bitscrape_types::{Event, EventPayload, InfoHash, NodeId};

fn tmp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("bitscrape-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config() -> SessionConfig {
    SessionConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        bootstrap_addrs: vec![],
        skip_bootstrap: true,
        fetch_cap: 1,
        ..Default::default()
    }
}

async fn send_get_peers(session: &Session, info_hash: InfoHash) {
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let msg = Message {
        transaction_id: ByteBuf::from(b"sf".to_vec()),
        version: None,
        kind: MessageKind::GetPeersRequest(GetPeersRequest {
            id: NodeId::random(),
            info_hash,
        }),
    };
    probe
        .send_to(
            &serialize_message(&msg).unwrap(),
            session.dht().listen_addr(),
        )
        .await
        .unwrap();
    // Wait for the answer so the whole inbound path has run.
    let mut buf = vec![0u8; 4096];
    tokio::time::timeout(Duration::from_secs(2), probe.recv_from(&mut buf))
        .await
        .expect("engine should answer get_peers")
        .unwrap();
}

async fn wait_until(mut probe: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !probe() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn discovery_launches_a_capped_fetch_and_stores_rows() {
    let dir = tmp_dir("flow");
    let out = dir.join("out.jsonl");
    let storage = Arc::new(JsonlStorage::spawn(out.clone()));
    let session = Session::start(test_config(), storage.clone(), None)
        .await
        .unwrap();

    let first = InfoHash::random();
    send_get_peers(&session, first).await;
    wait_until(|| session.stats().active_fetches == 1, "fetch launch").await;

    // The cap is 1: a second discovery is skipped, not queued.
    let second = InfoHash::random();
    send_get_peers(&session, second).await;
    wait_until(
        || session.stats().fetches_skipped_by_cap >= 1,
        "cap enforcement",
    )
    .await;
    assert_eq!(session.stats().active_fetches, 1);

    // A completed fetch tears its manager down and persists the bytes.
    let info_bytes = bytes::Bytes::from_static(b"d4:name4:demo6:lengthi5ee");
    session.bus().publish(&Event::new(EventPayload::MetadataReceived {
        info_hash: first,
        data: info_bytes.clone(),
    }));
    wait_until(|| session.stats().active_fetches == 0, "manager teardown").await;
    assert_eq!(session.stats().metadata_received, 1);

    session.shutdown().await;
    let contents = std::fs::read_to_string(&out).unwrap();
    assert!(contents.contains(&first.as_string()));
    assert!(contents.contains("\"kind\":\"infohash\""));
    assert!(contents.contains("\"kind\":\"metadata\""));
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn shutdown_snapshot_round_trips() {
    let dir = tmp_dir("snap");
    let snapshot = dir.join("table.bin");

    let config = SessionConfig {
        snapshot_path: Some(snapshot.clone()),
        ..test_config()
    };
    let session = Session::start(config.clone(), Arc::new(NullStorage), None)
        .await
        .unwrap();
    session.shutdown().await;
    assert!(snapshot.exists());

    // A fresh session accepts the snapshot.
    let session = Session::start(config.clone(), Arc::new(NullStorage), None)
        .await
        .unwrap();
    session.shutdown().await;

    // A corrupted snapshot is fatal startup state.
    std::fs::write(&snapshot, b"BSRTgarbage").unwrap();
    assert!(Session::start(config, Arc::new(NullStorage), None)
        .await
        .is_err());
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let session = Session::start(test_config(), Arc::new(NullStorage), None)
        .await
        .unwrap();
    session.shutdown().await;
    session.shutdown().await;
}
