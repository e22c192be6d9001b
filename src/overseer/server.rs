//! Overseer server: registration, heartbeats, placement, download lookups,
//! replica confirmations.
//!
//! Each accepted connection gets its own task. Handlers run against
//! Arc-shared services, so a handler failing or a connection dying never
//! poisons anything outside that connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::config::OverseerConfig;
use crate::common::error::{Error, Result};
use crate::common::packet::{Packet, PacketType};
use crate::common::payload::{
    decode_payload, decode_text, encode_payload, DownloadInfo, MetaUpdate, NodeReport,
    RegisterResponse, UploadRequest, UploadResponse,
};
use crate::common::utils::{format_bytes, new_file_id, timestamp_now_millis};
use crate::net::connection::split;
use crate::overseer::metadata::{FileRecord, MetadataStore};
use crate::overseer::persistence::PersistenceManager;
use crate::overseer::placement;
use crate::overseer::registry::NodeRegistry;

pub struct Overseer {
    config: OverseerConfig,
}

struct OverseerState {
    config: OverseerConfig,
    registry: NodeRegistry,
    metadata: Arc<MetadataStore>,
    persistence: Arc<PersistenceManager>,
}

/// A started overseer: bound address plus handles to stop it.
pub struct RunningOverseer {
    pub local_addr: SocketAddr,
    state: Arc<OverseerState>,
    accept_task: JoinHandle<()>,
    persist_task: JoinHandle<()>,
}

impl Overseer {
    pub fn new(config: OverseerConfig) -> Overseer {
        Overseer { config }
    }

    /// Bind and spawn the accept and persistence loops. Any metadata dump
    /// on disk is reloaded first.
    pub async fn start(self) -> Result<RunningOverseer> {
        info!("Starting overseer");
        info!("  bind addr: {}", self.config.bind_addr);
        info!("  dump path: {}", self.config.dump_path.display());
        info!("  heartbeat timeout: {:?}", self.config.heartbeat_timeout());

        let metadata = Arc::new(MetadataStore::new());
        let persistence = Arc::new(PersistenceManager::new(
            metadata.clone(),
            self.config.dump_path.clone(),
            self.config.persist_interval(),
        ));
        if let Err(e) = persistence.load().await {
            error!("metadata reload failed, starting empty: {}", e);
        }

        let registry = NodeRegistry::new(self.config.heartbeat_timeout());
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(OverseerState {
            config: self.config,
            registry,
            metadata,
            persistence: persistence.clone(),
        });

        let persist_task = persistence.spawn_periodic();
        let accept_task = tokio::spawn(accept_loop(listener, state.clone()));

        info!("✓ Overseer ready on {}", local_addr);
        Ok(RunningOverseer {
            local_addr,
            state,
            accept_task,
            persist_task,
        })
    }

    /// Run until ctrl-c, then dump metadata one final time.
    pub async fn serve(self) -> Result<()> {
        let running = self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        running.shutdown().await;
        Ok(())
    }
}

impl RunningOverseer {
    /// Live metadata table, mainly for integration tests polling replica
    /// confirmations.
    pub fn metadata(&self) -> Arc<MetadataStore> {
        self.state.metadata.clone()
    }

    /// Stop serving and write the final metadata dump.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        self.persist_task.abort();
        match self.state.persistence.dump().await {
            Ok(n) => info!("final metadata dump wrote {} records", n),
            Err(e) => error!("final metadata dump failed: {}", e),
        }
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<OverseerState>) {
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

async fn handle_connection(state: Arc<OverseerState>, stream: TcpStream, peer: SocketAddr) {
    debug!("connection from {}", peer);
    let (mut reader, writer) = split(stream);
    loop {
        match reader.next_packet().await {
            Ok(Some(packet)) => {
                let correlation_id = packet.correlation_id;
                let reply = match dispatch(&state, packet).await {
                    Ok(reply) => reply,
                    Err(e) => error_reply(correlation_id, &e),
                };
                if let Err(e) = writer.send(&reply).await {
                    warn!("reply to {} failed: {}", peer, e);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("closing connection from {}: {}", peer, e);
                break;
            }
        }
    }
    debug!("connection from {} closed", peer);
}

/// Failures that reject one request without closing the connection.
/// Heartbeat rejections use FAIL so the node knows to re-register;
/// everything else is an ERROR frame carrying the message.
fn error_reply(correlation_id: u32, error: &Error) -> Packet {
    match error {
        Error::HeartbeatMismatch(_) => Packet::new(
            PacketType::Fail,
            correlation_id,
            error.to_string().into_bytes(),
        ),
        _ => Packet::error(correlation_id, error.to_string()),
    }
}

async fn dispatch(state: &Arc<OverseerState>, packet: Packet) -> Result<Packet> {
    let correlation_id = packet.correlation_id;
    match packet.packet_type {
        PacketType::HeartBeat => {
            let report: NodeReport = decode_payload(&packet.payload)?;
            state.registry.heartbeat(&report).await?;
            debug!("heartbeat from {}", report.node_id);
            Ok(Packet::empty(PacketType::Success, correlation_id))
        }
        PacketType::StorageRegister => handle_register(state, correlation_id, &packet.payload).await,
        PacketType::UploadRequest => handle_upload(state, correlation_id, &packet.payload).await,
        PacketType::DownloadRequest => handle_download(state, correlation_id, &packet.payload).await,
        PacketType::UpdateFileMetaStorage => {
            handle_meta_update(state, correlation_id, &packet.payload).await
        }
        other => Err(Error::InvalidRequest(format!(
            "packet type {:?} not served by the overseer",
            other
        ))),
    }
}

async fn handle_register(
    state: &Arc<OverseerState>,
    correlation_id: u32,
    payload: &[u8],
) -> Result<Packet> {
    let report: NodeReport = decode_payload(payload)?;
    let response = match state.registry.register(&report).await {
        Ok(()) => RegisterResponse {
            accepted: true,
            message: String::new(),
        },
        Err(e @ Error::NodeConflict { .. }) => RegisterResponse {
            accepted: false,
            message: e.to_string(),
        },
        Err(e) => return Err(e),
    };
    Ok(Packet::new(
        PacketType::StorageRegisterResponse,
        correlation_id,
        encode_payload(&response)?,
    ))
}

async fn handle_upload(
    state: &Arc<OverseerState>,
    correlation_id: u32,
    payload: &[u8],
) -> Result<Packet> {
    let request: UploadRequest = decode_payload(payload)?;
    if request.filename.is_empty() {
        return Err(Error::InvalidRequest("filename is required".into()));
    }
    if request.size_bytes == 0 {
        return Err(Error::InvalidRequest("file size must be positive".into()));
    }
    let replica_count = if request.replica_count == 0 {
        state.config.default_replica_count
    } else {
        request.replica_count
    } as usize;

    // choose nodes first so a failed placement leaves no metadata behind
    let alive = state.registry.list_alive().await;
    let placements = placement::select(&alive, replica_count, request.size_bytes)?;

    let file_id = new_file_id();
    let record = FileRecord {
        file_id: file_id.clone(),
        filename: request.filename.clone(),
        size_bytes: request.size_bytes,
        md5: request.md5,
        desired_replica_count: replica_count as u32,
        upload_timestamp_ms: timestamp_now_millis(),
        replica_node_ids: Vec::new(),
    };
    state.metadata.put(record).await;

    info!(
        "upload {} granted: {} ({}) across {} nodes",
        file_id,
        request.filename,
        format_bytes(request.size_bytes),
        replica_count
    );

    let response = UploadResponse {
        file_id,
        placements: placements.iter().map(|n| n.to_node_addr()).collect(),
    };
    Ok(Packet::new(
        PacketType::UploadResponse,
        correlation_id,
        encode_payload(&response)?,
    ))
}

async fn handle_download(
    state: &Arc<OverseerState>,
    correlation_id: u32,
    payload: &[u8],
) -> Result<Packet> {
    let file_id = decode_text(payload)?;
    let record = state
        .metadata
        .get(&file_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("file {}", file_id)))?;

    let live = state.registry.get_alive(&record.replica_node_ids).await;
    if live.is_empty() {
        return Err(Error::NotFound(format!(
            "no live replica for file {}",
            file_id
        )));
    }

    let info = DownloadInfo {
        file_id,
        md5: record.md5,
        size_bytes: record.size_bytes,
        replicas: live.iter().map(|n| n.to_node_addr()).collect(),
    };
    Ok(Packet::new(
        PacketType::Success,
        correlation_id,
        encode_payload(&info)?,
    ))
}

async fn handle_meta_update(
    state: &Arc<OverseerState>,
    correlation_id: u32,
    payload: &[u8],
) -> Result<Packet> {
    let update: MetaUpdate = decode_payload(payload)?;
    state
        .metadata
        .append_replica_node(&update.file_id, &update.node_id)
        .await?;
    info!(
        "node {} confirmed replica of {} ({})",
        update.node_id,
        update.file_id,
        format_bytes(update.size_bytes)
    );
    Ok(Packet::empty(PacketType::Success, correlation_id))
}
