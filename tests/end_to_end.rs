//! Whole-cluster tests: overseer plus storage nodes on loopback ports,
//! driven through the client library.

use std::time::Duration;

use minidfs::common::config::{ClientConfig, OverseerConfig, StorageConfig, TransferConfig};
use minidfs::overseer::RunningOverseer;
use minidfs::storage::RunningStorageNode;
use minidfs::transfer::ProgressSink;
use minidfs::{DfsClient, Overseer, StorageNode};
use rand::RngCore;

fn small_transfers() -> TransferConfig {
    TransferConfig {
        shard_size: 16 * 1024,
        request_timeout_ms: 5_000,
    }
}

async fn start_cluster(
    dir: &tempfile::TempDir,
    nodes: usize,
) -> (RunningOverseer, Vec<RunningStorageNode>, DfsClient) {
    let overseer = Overseer::new(OverseerConfig {
        bind_addr: "127.0.0.1:0".into(),
        heartbeat_timeout_ms: 1_500,
        persist_interval_ms: 60_000,
        dump_path: dir.path().join("meta.dump"),
        default_replica_count: 2,
        transfer: small_transfers(),
    })
    .start()
    .await
    .unwrap();

    let mut storages = Vec::new();
    for i in 0..nodes {
        let node = StorageNode::new(StorageConfig {
            bind_addr: "127.0.0.1:0".into(),
            advertise_host: "127.0.0.1".into(),
            advertise_port: 0,
            overseer_addr: overseer.local_addr.to_string(),
            data_dir: dir.path().join(format!("node-{}", i)),
            capacity_bytes: 1 << 30,
            heartbeat_interval_ms: 300,
            transfer: small_transfers(),
        })
        .start()
        .await
        .unwrap();
        storages.push(node);
    }

    let client = DfsClient::new(ClientConfig {
        overseer_addr: overseer.local_addr.to_string(),
        transfer: small_transfers(),
    });
    (overseer, storages, client)
}

async fn random_file(dir: &tempfile::TempDir, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    let path = dir.path().join(name);
    tokio::fs::write(&path, &data).await.unwrap();
    (path, data)
}

/// Replica confirmations arrive on the relay's schedule, not the upload's.
async fn wait_for_replicas(overseer: &RunningOverseer, file_id: &str, want: usize) {
    for _ in 0..100 {
        if let Some(record) = overseer.metadata().get(file_id).await {
            if record.replica_node_ids.len() >= want {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("file {} never reached {} replicas", file_id, want);
}

#[tokio::test]
async fn test_upload_download_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (overseer, storages, client) = start_cluster(&dir, 3).await;

    // seven shards at the test shard size
    let (path, data) = random_file(&dir, "input.bin", 100_000).await;
    let receipt = client
        .upload(&path, 2, ProgressSink::disabled())
        .await
        .unwrap();
    assert_eq!(receipt.size_bytes, data.len() as u64);
    assert_eq!(receipt.replicas.len(), 2);

    wait_for_replicas(&overseer, &receipt.file_id, 2).await;

    let out = dir.path().join("output.bin");
    let download = client
        .download(&receipt.file_id, &out, ProgressSink::disabled())
        .await
        .unwrap();
    assert_eq!(download.size_bytes, data.len() as u64);
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    assert!(receipt.replicas.contains(&download.source));

    for node in storages {
        node.shutdown().await;
    }
    overseer.shutdown().await;
}

#[tokio::test]
async fn test_download_survives_losing_a_replica() {
    let dir = tempfile::tempdir().unwrap();
    let (overseer, mut storages, client) = start_cluster(&dir, 3).await;

    let (path, data) = random_file(&dir, "precious.bin", 60_000).await;
    let receipt = client
        .upload(&path, 3, ProgressSink::disabled())
        .await
        .unwrap();
    wait_for_replicas(&overseer, &receipt.file_id, 3).await;

    // take one holder down and let its heartbeats age out
    let lost = storages.remove(0);
    lost.shutdown().await;
    tokio::time::sleep(Duration::from_millis(2_000)).await;

    for round in 0..3 {
        let out = dir.path().join(format!("copy-{}.bin", round));
        client
            .download(&receipt.file_id, &out, ProgressSink::disabled())
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    }

    for node in storages {
        node.shutdown().await;
    }
    overseer.shutdown().await;
}

#[tokio::test]
async fn test_upload_needing_more_nodes_than_alive_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (overseer, storages, client) = start_cluster(&dir, 1).await;

    let (path, _) = random_file(&dir, "too-wide.bin", 1_000).await;
    let err = client
        .upload(&path, 3, ProgressSink::disabled())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Insufficient capacity"), "got: {}", err);

    for node in storages {
        node.shutdown().await;
    }
    overseer.shutdown().await;
}

#[tokio::test]
async fn test_upload_progress_reaches_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let (overseer, storages, client) = start_cluster(&dir, 1).await;

    let (path, data) = random_file(&dir, "tracked.bin", 50_000).await;
    let (sink, mut events) = ProgressSink::channel();
    let receipt = client.upload(&path, 1, sink).await.unwrap();
    assert_eq!(receipt.size_bytes, data.len() as u64);

    // the sender side died with the upload, so the stream has a real end
    let mut last = None;
    while let Some(event) = events.recv().await {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.bytes_done, data.len() as u64);
    assert_eq!(last.percent(), 100);

    for node in storages {
        node.shutdown().await;
    }
    overseer.shutdown().await;
}

#[tokio::test]
async fn test_default_replica_count_applies_when_zero_requested() {
    let dir = tempfile::tempdir().unwrap();
    let (overseer, storages, client) = start_cluster(&dir, 3).await;

    let (path, _) = random_file(&dir, "default.bin", 8_000).await;
    // cluster default is two
    let receipt = client
        .upload(&path, 0, ProgressSink::disabled())
        .await
        .unwrap();
    assert_eq!(receipt.replicas.len(), 2);
    wait_for_replicas(&overseer, &receipt.file_id, 2).await;

    for node in storages {
        node.shutdown().await;
    }
    overseer.shutdown().await;
}
