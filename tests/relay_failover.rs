//! Relay failover tests: the replication chain skips dead hops, hands the
//! remaining work to the first live node, and gives up cleanly when nobody
//! answers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use minidfs::common::hash::md5_bytes;
use minidfs::common::packet::{Packet, PacketType};
use minidfs::common::payload::{decode_payload, FileShard, NodeAddr, TransferEnd};
use minidfs::net::connection::split;
use minidfs::net::ClientPool;
use minidfs::storage::{relay_file, StoredFile};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

type ReceivedBytes = Arc<Mutex<HashMap<String, Vec<u8>>>>;
type ReceivedEnds = Arc<Mutex<Vec<TransferEnd>>>;

/// A minimal storage-node stand-in that acks HEAD and END and collects the
/// BODY bytes in between.
async fn spawn_mock_hop(received: ReceivedBytes, ends: ReceivedEnds) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let received = received.clone();
            let ends = ends.clone();
            tokio::spawn(async move {
                let (mut reader, writer) = split(stream);
                while let Ok(Some(packet)) = reader.next_packet().await {
                    match packet.packet_type {
                        PacketType::TransferFileHead => {
                            let ack =
                                Packet::empty(PacketType::TransferResponse, packet.correlation_id);
                            writer.send(&ack).await.unwrap();
                        }
                        PacketType::TransferFileBody => {
                            let shard: FileShard = decode_payload(&packet.payload).unwrap();
                            received
                                .lock()
                                .await
                                .entry(shard.file_id)
                                .or_default()
                                .extend(shard.data);
                        }
                        PacketType::TransferFileEnd => {
                            let end: TransferEnd = decode_payload(&packet.payload).unwrap();
                            ends.lock().await.push(end);
                            let ack = Packet::empty(PacketType::Success, packet.correlation_id);
                            writer.send(&ack).await.unwrap();
                        }
                        _ => {}
                    }
                }
            });
        }
    });
    addr
}

/// An address nothing listens on.
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn target(node_id: &str, addr: SocketAddr) -> NodeAddr {
    NodeAddr {
        node_id: node_id.into(),
        host: addr.ip().to_string(),
        port: addr.port(),
    }
}

async fn stored_fixture(dir: &tempfile::TempDir, file_id: &str, len: usize) -> (StoredFile, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.path().join(file_id);
    tokio::fs::write(&path, &data).await.unwrap();
    let stored = StoredFile {
        file_id: file_id.into(),
        path,
        size_bytes: data.len() as u64,
        md5: md5_bytes(&data),
    };
    (stored, data)
}

#[tokio::test]
async fn test_relay_skips_dead_hops() {
    let dir = tempfile::tempdir().unwrap();
    let (stored, data) = stored_fixture(&dir, "relay-1", 10_000).await;

    let received: ReceivedBytes = Arc::new(Mutex::new(HashMap::new()));
    let ends: ReceivedEnds = Arc::new(Mutex::new(Vec::new()));
    let live = spawn_mock_hop(received.clone(), ends.clone()).await;

    let targets = vec![
        target("dead-a", dead_addr().await),
        target("dead-b", dead_addr().await),
        target("live-c", live),
    ];

    let pool = ClientPool::new(Duration::from_secs(2));
    let outcome = relay_file(&pool, &stored, targets, 1024).await;

    assert_eq!(outcome.delivered_to.as_deref(), Some("live-c"));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(received.lock().await.get("relay-1").unwrap(), &data);

    // the live hop inherits the hops that still owe a copy
    let ends = ends.lock().await;
    assert_eq!(ends.len(), 1);
    let remaining: Vec<&str> = ends[0]
        .remaining_targets
        .iter()
        .map(|t| t.node_id.as_str())
        .collect();
    assert_eq!(remaining, vec!["dead-a", "dead-b"]);
}

#[tokio::test]
async fn test_relay_gives_up_when_every_hop_is_dead() {
    let dir = tempfile::tempdir().unwrap();
    let (stored, _) = stored_fixture(&dir, "relay-2", 2_000).await;

    let targets = vec![
        target("dead-a", dead_addr().await),
        target("dead-b", dead_addr().await),
    ];

    let pool = ClientPool::new(Duration::from_secs(2));
    let outcome = relay_file(&pool, &stored, targets, 1024).await;

    // one try per target, then a clean stop
    assert_eq!(outcome.delivered_to, None);
    assert_eq!(outcome.attempts, 2);
}

#[tokio::test]
async fn test_relay_delivers_directly_when_first_hop_lives() {
    let dir = tempfile::tempdir().unwrap();
    let (stored, data) = stored_fixture(&dir, "relay-3", 5_000).await;

    let received: ReceivedBytes = Arc::new(Mutex::new(HashMap::new()));
    let ends: ReceivedEnds = Arc::new(Mutex::new(Vec::new()));
    let live = spawn_mock_hop(received.clone(), ends.clone()).await;

    let pool = ClientPool::new(Duration::from_secs(2));
    let outcome = relay_file(&pool, &stored, vec![target("live-a", live)], 512).await;

    assert_eq!(outcome.delivered_to.as_deref(), Some("live-a"));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(received.lock().await.get("relay-3").unwrap(), &data);
    assert!(ends.lock().await[0].remaining_targets.is_empty());
}

#[tokio::test]
async fn test_relay_with_no_targets_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let (stored, _) = stored_fixture(&dir, "relay-4", 100).await;

    let pool = ClientPool::new(Duration::from_secs(2));
    let outcome = relay_file(&pool, &stored, Vec::new(), 1024).await;

    assert_eq!(outcome.delivered_to, None);
    assert_eq!(outcome.attempts, 0);
}
