//! Storage-node server: receives shard streams, serves downloads, relays
//! replicas.
//!
//! Transfers are connection-scoped: a HEAD opens a session, BODY frames feed
//! it, and END seals it. If the sending connection dies in between, the
//! session is abandoned and the partial file deleted, so a crashed uploader
//! never leaves a half-written replica that the overseer believes in.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::config::StorageConfig;
use crate::common::error::{Error, Result};
use crate::common::packet::{Packet, PacketType};
use crate::common::payload::{
    decode_payload, decode_text, encode_payload, FileShard, MetaUpdate, NodeReport, TransferEnd,
    TransferHead,
};
use crate::common::utils::{format_bytes, new_node_id};
use crate::net::client::ClientPool;
use crate::net::connection::{split, FrameWriter};
use crate::storage::node::{heartbeat_loop, register_with_overseer};
use crate::storage::relay::relay_file;
use crate::storage::store::{FileStore, StoredFile};
use crate::transfer::progress::ProgressSink;
use crate::transfer::session::{SessionMap, TransferSession};
use crate::transfer::splitter::ShardSplitter;

pub struct StorageNode {
    config: StorageConfig,
}

pub(crate) struct StorageState {
    pub(crate) node_id: String,
    pub(crate) config: StorageConfig,
    pub(crate) store: Arc<FileStore>,
    pub(crate) sessions: SessionMap,
    pub(crate) pool: ClientPool,
}

impl StorageState {
    pub(crate) async fn node_report(&self) -> NodeReport {
        NodeReport {
            node_id: self.node_id.clone(),
            host: self.config.advertise_host.clone(),
            port: self.config.advertise_port,
            used_bytes: self.store.used_bytes().await,
            free_bytes: self.store.free_bytes().await,
        }
    }
}

/// A started storage node: bound address, generated id, and stop handles.
pub struct RunningStorageNode {
    pub local_addr: SocketAddr,
    pub node_id: String,
    state: Arc<StorageState>,
    accept_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl StorageNode {
    pub fn new(config: StorageConfig) -> StorageNode {
        StorageNode { config }
    }

    /// Open the data directory, bind, register with the overseer, and spawn
    /// the accept and heartbeat loops. Fails if the overseer is unreachable
    /// or refuses the registration.
    pub async fn start(self) -> Result<RunningStorageNode> {
        let mut config = self.config;

        info!("Starting storage node");
        info!("  bind addr: {}", config.bind_addr);
        info!("  data dir: {}", config.data_dir.display());
        info!("  overseer: {}", config.overseer_addr);
        info!("  capacity: {}", format_bytes(config.capacity_bytes));

        let store = Arc::new(FileStore::open(config.data_dir.clone(), config.capacity_bytes).await?);
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        if config.advertise_port == 0 {
            config.advertise_port = local_addr.port();
        }

        let node_id = new_node_id();
        let pool = ClientPool::new(config.transfer.request_timeout());
        let state = Arc::new(StorageState {
            node_id: node_id.clone(),
            config,
            store,
            sessions: SessionMap::new(),
            pool,
        });

        register_with_overseer(&state).await?;

        let heartbeat_task = tokio::spawn(heartbeat_loop(state.clone()));
        let accept_task = tokio::spawn(accept_loop(listener, state.clone()));

        info!("✓ Storage node {} ready on {}", node_id, local_addr);
        Ok(RunningStorageNode {
            local_addr,
            node_id,
            state,
            accept_task,
            heartbeat_task,
        })
    }

    /// Run until ctrl-c.
    pub async fn serve(self) -> Result<()> {
        let running = self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        running.shutdown().await;
        Ok(())
    }
}

impl RunningStorageNode {
    /// Local replica table, mainly for tests inspecting what landed on disk.
    pub fn store(&self) -> Arc<FileStore> {
        self.state.store.clone()
    }

    pub async fn shutdown(self) {
        self.accept_task.abort();
        self.heartbeat_task.abort();
        info!("storage node {} stopped", self.node_id);
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<StorageState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                tokio::spawn(handle_connection(state.clone(), stream, peer));
            }
            Err(e) => {
                warn!("accept failed: {}", e);
            }
        }
    }
}

async fn handle_connection(state: Arc<StorageState>, stream: TcpStream, peer: SocketAddr) {
    debug!("connection from {}", peer);
    let (mut reader, writer) = split(stream);
    // file ids whose inbound session belongs to this connection
    let mut open_transfers: Vec<String> = Vec::new();
    loop {
        match reader.next_packet().await {
            Ok(Some(packet)) => {
                let correlation_id = packet.correlation_id;
                match dispatch(&state, &writer, &mut open_transfers, packet).await {
                    Ok(Some(reply)) => {
                        if let Err(e) = writer.send(&reply).await {
                            warn!("reply to {} failed: {}", peer, e);
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let reply = Packet::error(correlation_id, e.to_string());
                        if let Err(send_err) = writer.send(&reply).await {
                            warn!("reply to {} failed: {}", peer, send_err);
                            break;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("closing connection from {}: {}", peer, e);
                break;
            }
        }
    }
    // a dropped connection abandons whatever it was mid-way through sending
    for file_id in open_transfers {
        if let Some(session) = state.sessions.take(&file_id).await {
            session.abandon().await;
            state.sessions.release(&file_id).await;
        }
    }
    debug!("connection from {} closed", peer);
}

/// `Ok(Some)` is a reply for the caller to send; `Ok(None)` means the handler
/// replied itself or the frame takes no reply (BODY).
async fn dispatch(
    state: &Arc<StorageState>,
    writer: &FrameWriter,
    open_transfers: &mut Vec<String>,
    packet: Packet,
) -> Result<Option<Packet>> {
    let correlation_id = packet.correlation_id;
    match packet.packet_type {
        PacketType::TransferFileHead => handle_head(state, open_transfers, &packet.payload)
            .await
            .map(|_| Some(Packet::empty(PacketType::TransferResponse, correlation_id))),
        PacketType::TransferFileBody => handle_body(state, open_transfers, &packet.payload)
            .await
            .map(|_| None),
        PacketType::TransferFileEnd => {
            handle_end(state, writer, open_transfers, correlation_id, &packet.payload)
                .await
                .map(|_| None)
        }
        PacketType::DownloadRequest => {
            handle_download(state, writer, correlation_id, &packet.payload)
                .await
                .map(|_| None)
        }
        other => Err(Error::InvalidRequest(format!(
            "packet type {:?} not served by storage nodes",
            other
        ))),
    }
}

async fn handle_head(
    state: &Arc<StorageState>,
    open_transfers: &mut Vec<String>,
    payload: &[u8],
) -> Result<()> {
    let head: TransferHead = decode_payload(payload)?;
    // claim the id before opening: a second HEAD's File::create would
    // truncate the in-flight copy
    state.sessions.reserve(&head.file_id).await?;
    let dest = state.store.locate(&head.file_id);
    let session = match TransferSession::open(
        &head.file_id,
        dest,
        head.md5,
        head.total_size,
        ProgressSink::disabled(),
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            state.sessions.release(&head.file_id).await;
            return Err(e);
        }
    };
    state.sessions.restore(session).await;
    open_transfers.push(head.file_id.clone());
    debug!(
        "inbound transfer {}: {} in {} shards",
        head.file_id,
        format_bytes(head.total_size),
        head.shard_count
    );
    Ok(())
}

async fn handle_body(
    state: &Arc<StorageState>,
    open_transfers: &mut Vec<String>,
    payload: &[u8],
) -> Result<()> {
    let shard: FileShard = decode_payload(payload)?;
    let mut session = state
        .sessions
        .take(&shard.file_id)
        .await
        .ok_or_else(|| Error::SessionNotFound(shard.file_id.clone()))?;
    match session.append(&shard.data).await {
        Ok(()) => {
            state.sessions.restore(session).await;
            Ok(())
        }
        Err(e) => {
            session.abandon().await;
            state.sessions.release(&shard.file_id).await;
            open_transfers.retain(|id| id != &shard.file_id);
            Err(e)
        }
    }
}

/// Seal the transfer, confirm the replica with the overseer, answer the
/// sender with the overseer's verdict, then relay to any remaining targets.
async fn handle_end(
    state: &Arc<StorageState>,
    writer: &FrameWriter,
    open_transfers: &mut Vec<String>,
    correlation_id: u32,
    payload: &[u8],
) -> Result<()> {
    let end: TransferEnd = decode_payload(payload)?;
    let session = state
        .sessions
        .take(&end.file_id)
        .await
        .ok_or_else(|| Error::SessionNotFound(end.file_id.clone()))?;
    open_transfers.retain(|id| id != &end.file_id);

    let expected_md5 = session.expected_md5();
    let finished = session.finish().await;
    state.sessions.release(&end.file_id).await;
    let summary = finished?;

    let stored = StoredFile {
        file_id: end.file_id.clone(),
        path: state.store.locate(&end.file_id),
        size_bytes: summary.size_bytes,
        md5: expected_md5,
    };
    state.store.record(stored.clone()).await;
    info!(
        "stored {} ({}) in {:?}",
        end.file_id,
        format_bytes(summary.size_bytes),
        summary.elapsed
    );

    let update = MetaUpdate {
        file_id: end.file_id.clone(),
        node_id: state.node_id.clone(),
        size_bytes: summary.size_bytes,
    };
    let reply = match confirm_replica(state, &update).await {
        Ok(packet) => Packet::new(packet.packet_type, correlation_id, packet.payload),
        Err(e) => {
            warn!("replica confirmation for {} failed: {}", end.file_id, e);
            Packet::error(correlation_id, format!("replica confirmation failed: {}", e))
        }
    };
    writer.send(&reply).await?;

    // replication continues in the background, off this connection's task
    if !end.remaining_targets.is_empty() {
        let state = state.clone();
        let targets = end.remaining_targets;
        tokio::spawn(async move {
            let shard_size = state.config.transfer.shard_size as usize;
            relay_file(&state.pool, &stored, targets, shard_size).await;
        });
    }
    Ok(())
}

async fn confirm_replica(state: &Arc<StorageState>, update: &MetaUpdate) -> Result<Packet> {
    let client = state.pool.get(&state.config.overseer_addr).await?;
    client
        .request(PacketType::UpdateFileMetaStorage, encode_payload(update)?)
        .await
}

/// Push HEAD, BODY frames, and END down the requesting connection, all under
/// the request's correlation id. Local misses answer with an ERROR frame and
/// keep the connection alive.
async fn handle_download(
    state: &Arc<StorageState>,
    writer: &FrameWriter,
    correlation_id: u32,
    payload: &[u8],
) -> Result<()> {
    let file_id = decode_text(payload)?;
    let stored = match state.store.get(&file_id).await {
        Some(stored) => stored,
        None => {
            let reply = Packet::error(correlation_id, format!("file {} not stored here", file_id));
            writer.send(&reply).await?;
            return Ok(());
        }
    };

    let shard_size = state.config.transfer.shard_size as usize;
    let mut splitter =
        match ShardSplitter::open(&stored.path, shard_size, ProgressSink::disabled()).await {
            Ok(splitter) => splitter,
            Err(e) => {
                warn!("cannot read {} for download: {}", stored.path.display(), e);
                let reply = Packet::error(correlation_id, format!("read failed: {}", e));
                writer.send(&reply).await?;
                return Ok(());
            }
        };

    let head = TransferHead {
        file_id: file_id.clone(),
        md5: stored.md5,
        total_size: splitter.total_size(),
        shard_count: splitter.shard_count(),
    };
    writer
        .send(&Packet::new(
            PacketType::TransferFileHead,
            correlation_id,
            encode_payload(&head)?,
        ))
        .await?;

    loop {
        match splitter.next_shard().await {
            Ok(Some(shard)) => {
                let body = FileShard {
                    file_id: file_id.clone(),
                    data: shard.to_vec(),
                };
                writer
                    .send(&Packet::new(
                        PacketType::TransferFileBody,
                        correlation_id,
                        encode_payload(&body)?,
                    ))
                    .await?;
            }
            Ok(None) => break,
            Err(e) => {
                // the HEAD is already out; tell the receiver the stream died
                warn!("read of {} failed mid-download: {}", stored.path.display(), e);
                let reply = Packet::error(correlation_id, format!("read failed: {}", e));
                writer.send(&reply).await?;
                return Ok(());
            }
        }
    }

    let end = TransferEnd {
        file_id: file_id.clone(),
        remaining_targets: Vec::new(),
    };
    writer
        .send(&Packet::new(
            PacketType::TransferFileEnd,
            correlation_id,
            encode_payload(&end)?,
        ))
        .await?;
    info!("served {} ({})", file_id, format_bytes(stored.size_bytes));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::OverseerConfig;
    use crate::common::hash::md5_bytes;
    use crate::common::payload::{UploadRequest, UploadResponse};
    use crate::net::client::{response_to_result, NodeClient};
    use crate::overseer::server::{Overseer, RunningOverseer};
    use std::time::Duration;

    async fn start_overseer(dir: &tempfile::TempDir) -> RunningOverseer {
        let config = OverseerConfig {
            bind_addr: "127.0.0.1:0".into(),
            dump_path: dir.path().join("meta.dump"),
            ..OverseerConfig::default()
        };
        Overseer::new(config).start().await.unwrap()
    }

    async fn start_storage(dir: &tempfile::TempDir, overseer_addr: &str) -> RunningStorageNode {
        let config = StorageConfig {
            bind_addr: "127.0.0.1:0".into(),
            overseer_addr: overseer_addr.into(),
            data_dir: dir.path().join("data"),
            heartbeat_interval_ms: 60_000,
            ..StorageConfig::default()
        };
        StorageNode::new(config).start().await.unwrap()
    }

    async fn grant_upload(
        overseer: &RunningOverseer,
        data: &[u8],
        replica_count: u32,
    ) -> UploadResponse {
        let client = NodeClient::connect(&overseer.local_addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        let request = UploadRequest {
            filename: "blob.bin".into(),
            size_bytes: data.len() as u64,
            md5: md5_bytes(data),
            replica_count,
        };
        let reply = client
            .request(PacketType::UploadRequest, encode_payload(&request).unwrap())
            .await
            .unwrap();
        decode_payload(&response_to_result(reply).unwrap().payload).unwrap()
    }

    #[tokio::test]
    async fn test_receive_transfer_and_confirm_replica() {
        let dir = tempfile::tempdir().unwrap();
        let overseer = start_overseer(&dir).await;
        let storage = start_storage(&dir, &overseer.local_addr.to_string()).await;

        let data = vec![0xA5u8; 9_000];
        let grant = grant_upload(&overseer, &data, 1).await;
        assert_eq!(grant.placements.len(), 1);

        let client = NodeClient::connect(&grant.placements[0].addr(), Duration::from_secs(2))
            .await
            .unwrap();

        let head = TransferHead {
            file_id: grant.file_id.clone(),
            md5: md5_bytes(&data),
            total_size: data.len() as u64,
            shard_count: 1,
        };
        let reply = client
            .request(PacketType::TransferFileHead, encode_payload(&head).unwrap())
            .await
            .unwrap();
        assert_eq!(reply.packet_type, PacketType::TransferResponse);

        let body = FileShard {
            file_id: grant.file_id.clone(),
            data: data.clone(),
        };
        client
            .send(Packet::new(
                PacketType::TransferFileBody,
                client.next_correlation_id(),
                encode_payload(&body).unwrap(),
            ))
            .await
            .unwrap();

        let end = TransferEnd {
            file_id: grant.file_id.clone(),
            remaining_targets: Vec::new(),
        };
        let reply = client
            .request(PacketType::TransferFileEnd, encode_payload(&end).unwrap())
            .await
            .unwrap();
        assert_eq!(reply.packet_type, PacketType::Success);

        // bytes are on disk and the overseer learned about the replica
        let path = storage.store().locate(&grant.file_id);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
        let record = overseer.metadata().get(&grant.file_id).await.unwrap();
        assert_eq!(record.replica_node_ids, vec![storage.node_id.clone()]);

        storage.shutdown().await;
        overseer.shutdown().await;
    }

    #[tokio::test]
    async fn test_body_without_head_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let overseer = start_overseer(&dir).await;
        let storage = start_storage(&dir, &overseer.local_addr.to_string()).await;

        let client = NodeClient::connect(&storage.local_addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        let shard = FileShard {
            file_id: "never-opened".into(),
            data: b"orphan".to_vec(),
        };
        let reply = client
            .request(PacketType::TransferFileBody, encode_payload(&shard).unwrap())
            .await
            .unwrap();
        assert!(response_to_result(reply).is_err());

        storage.shutdown().await;
        overseer.shutdown().await;
    }

    #[tokio::test]
    async fn test_corrupt_transfer_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let overseer = start_overseer(&dir).await;
        let storage = start_storage(&dir, &overseer.local_addr.to_string()).await;

        let data = b"the real content".to_vec();
        let grant = grant_upload(&overseer, &data, 1).await;
        let client = NodeClient::connect(&grant.placements[0].addr(), Duration::from_secs(2))
            .await
            .unwrap();

        let head = TransferHead {
            file_id: grant.file_id.clone(),
            md5: md5_bytes(&data),
            total_size: data.len() as u64,
            shard_count: 1,
        };
        client
            .request(PacketType::TransferFileHead, encode_payload(&head).unwrap())
            .await
            .unwrap();

        let body = FileShard {
            file_id: grant.file_id.clone(),
            data: b"corrupted bytes!".to_vec(),
        };
        client
            .send(Packet::new(
                PacketType::TransferFileBody,
                client.next_correlation_id(),
                encode_payload(&body).unwrap(),
            ))
            .await
            .unwrap();

        let end = TransferEnd {
            file_id: grant.file_id.clone(),
            remaining_targets: Vec::new(),
        };
        let reply = client
            .request(PacketType::TransferFileEnd, encode_payload(&end).unwrap())
            .await
            .unwrap();
        assert!(response_to_result(reply).is_err());

        let path = storage.store().locate(&grant.file_id);
        assert!(!path.exists());
        let record = overseer.metadata().get(&grant.file_id).await.unwrap();
        assert!(record.replica_node_ids.is_empty());

        storage.shutdown().await;
        overseer.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_mid_transfer_abandons_session() {
        let dir = tempfile::tempdir().unwrap();
        let overseer = start_overseer(&dir).await;
        let storage = start_storage(&dir, &overseer.local_addr.to_string()).await;

        let data = vec![7u8; 4_096];
        let grant = grant_upload(&overseer, &data, 1).await;
        let client = NodeClient::connect(&grant.placements[0].addr(), Duration::from_secs(2))
            .await
            .unwrap();

        let head = TransferHead {
            file_id: grant.file_id.clone(),
            md5: md5_bytes(&data),
            total_size: data.len() as u64,
            shard_count: 2,
        };
        client
            .request(PacketType::TransferFileHead, encode_payload(&head).unwrap())
            .await
            .unwrap();
        let body = FileShard {
            file_id: grant.file_id.clone(),
            data: data[..2_048].to_vec(),
        };
        client
            .send(Packet::new(
                PacketType::TransferFileBody,
                client.next_correlation_id(),
                encode_payload(&body).unwrap(),
            ))
            .await
            .unwrap();

        let path = storage.store().locate(&grant.file_id);
        drop(client);

        // cleanup runs on the connection task; give it a moment
        let mut gone = false;
        for _ in 0..50 {
            if !path.exists() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "partial file should be deleted on disconnect");

        storage.shutdown().await;
        overseer.shutdown().await;
    }

    #[tokio::test]
    async fn test_competing_head_cannot_disturb_an_inflight_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let overseer = start_overseer(&dir).await;
        let storage = start_storage(&dir, &overseer.local_addr.to_string()).await;

        let data = vec![0x3Cu8; 12_000];
        let grant = grant_upload(&overseer, &data, 1).await;
        let addr = grant.placements[0].addr();

        let uploader = NodeClient::connect(&addr, Duration::from_secs(2))
            .await
            .unwrap();
        let head = TransferHead {
            file_id: grant.file_id.clone(),
            md5: md5_bytes(&data),
            total_size: data.len() as u64,
            shard_count: 2,
        };
        let reply = uploader
            .request(PacketType::TransferFileHead, encode_payload(&head).unwrap())
            .await
            .unwrap();
        assert_eq!(reply.packet_type, PacketType::TransferResponse);

        let first = FileShard {
            file_id: grant.file_id.clone(),
            data: data[..6_000].to_vec(),
        };
        uploader
            .send(Packet::new(
                PacketType::TransferFileBody,
                uploader.next_correlation_id(),
                encode_payload(&first).unwrap(),
            ))
            .await
            .unwrap();

        // a second connection replaying HEAD for the same file is turned
        // away before it can reopen the destination file
        let rival = NodeClient::connect(&addr, Duration::from_secs(2))
            .await
            .unwrap();
        let reply = rival
            .request(PacketType::TransferFileHead, encode_payload(&head).unwrap())
            .await
            .unwrap();
        let err = response_to_result(reply).unwrap_err();
        assert!(err.to_string().contains("already in progress"));

        let second = FileShard {
            file_id: grant.file_id.clone(),
            data: data[6_000..].to_vec(),
        };
        uploader
            .send(Packet::new(
                PacketType::TransferFileBody,
                uploader.next_correlation_id(),
                encode_payload(&second).unwrap(),
            ))
            .await
            .unwrap();
        let end = TransferEnd {
            file_id: grant.file_id.clone(),
            remaining_targets: Vec::new(),
        };
        let reply = uploader
            .request(PacketType::TransferFileEnd, encode_payload(&end).unwrap())
            .await
            .unwrap();
        assert_eq!(reply.packet_type, PacketType::Success);

        // the rejected HEAD never touched the winner's bytes
        let path = storage.store().locate(&grant.file_id);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);

        storage.shutdown().await;
        overseer.shutdown().await;
    }
}
