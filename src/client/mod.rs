//! Client library: upload a file into the cluster, download it back.
//!
//! Uploads stream the file to the first placed node only; that node relays
//! the remaining copies in the background. Downloads ask the overseer where
//! the replicas live, pick one at random, and receive the pushed
//! HEAD/BODY/END stream on a dedicated connection.

use std::path::Path;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::common::config::ClientConfig;
use crate::common::error::{Error, Result};
use crate::common::hash::md5_file;
use crate::common::packet::{Packet, PacketType};
use crate::common::payload::{
    decode_payload, encode_payload, DownloadInfo, FileShard, TransferEnd, TransferHead,
    UploadRequest, UploadResponse,
};
use crate::common::utils::format_bytes;
use crate::net::client::{response_to_result, ClientPool, NodeClient};
use crate::transfer::progress::ProgressSink;
use crate::transfer::session::{TransferSession, TransferSummary};
use crate::transfer::splitter::ShardSplitter;

/// What an upload left behind.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub file_id: String,
    pub size_bytes: u64,
    pub md5: [u8; 16],
    /// Node ids the overseer placed the file on.
    pub replicas: Vec<String>,
    pub elapsed: Duration,
}

/// Where a download came from and what it wrote.
#[derive(Debug, Clone)]
pub struct DownloadReceipt {
    pub file_id: String,
    pub size_bytes: u64,
    /// Node id of the replica that served the bytes.
    pub source: String,
    pub elapsed: Duration,
}

pub struct DfsClient {
    config: ClientConfig,
    pool: ClientPool,
}

impl DfsClient {
    pub fn new(config: ClientConfig) -> DfsClient {
        let pool = ClientPool::new(config.transfer.request_timeout());
        DfsClient { config, pool }
    }

    /// Upload `path`: ask the overseer for placements, stream the file to the
    /// first one, and let it fan the rest out. `replica_count` of zero asks
    /// for the cluster default.
    pub async fn upload(
        &self,
        path: &Path,
        replica_count: u32,
        progress: ProgressSink,
    ) -> Result<UploadReceipt> {
        let started = Instant::now();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidRequest(format!("no usable filename in {}", path.display())))?
            .to_string();

        let (md5, size_bytes) = md5_file(path).await?;
        debug!(
            "uploading {} ({}), digest {}",
            filename,
            format_bytes(size_bytes),
            crate::common::hash::hex_digest(&md5)
        );

        let overseer = self.pool.get(&self.config.overseer_addr).await?;
        let request = UploadRequest {
            filename: filename.clone(),
            size_bytes,
            md5,
            replica_count,
        };
        let reply = overseer
            .request(PacketType::UploadRequest, encode_payload(&request)?)
            .await?;
        let grant: UploadResponse = decode_payload(&response_to_result(reply)?.payload)?;
        let primary = grant
            .placements
            .first()
            .ok_or_else(|| Error::Protocol("overseer granted an upload with no placements".into()))?;

        let shard_size = self.config.transfer.shard_size as usize;
        let mut splitter = ShardSplitter::open(path, shard_size, progress).await?;

        let node = self.pool.get(&primary.addr()).await?;
        let head = TransferHead {
            file_id: grant.file_id.clone(),
            md5,
            total_size: size_bytes,
            shard_count: splitter.shard_count(),
        };
        let reply = node
            .request(PacketType::TransferFileHead, encode_payload(&head)?)
            .await?;
        response_to_result(reply)?;

        while let Some(shard) = splitter.next_shard().await? {
            let body = FileShard {
                file_id: grant.file_id.clone(),
                data: shard.to_vec(),
            };
            node.send(Packet::new(
                PacketType::TransferFileBody,
                node.next_correlation_id(),
                encode_payload(&body)?,
            ))
            .await?;
        }

        let end = TransferEnd {
            file_id: grant.file_id.clone(),
            remaining_targets: grant.placements[1..].to_vec(),
        };
        let reply = node
            .request(PacketType::TransferFileEnd, encode_payload(&end)?)
            .await?;
        response_to_result(reply)?;

        let elapsed = started.elapsed();
        info!(
            "uploaded {} as {} ({}) in {:?}",
            filename,
            grant.file_id,
            format_bytes(size_bytes),
            elapsed
        );
        Ok(UploadReceipt {
            file_id: grant.file_id,
            size_bytes,
            md5,
            replicas: grant.placements.iter().map(|p| p.node_id.clone()).collect(),
            elapsed,
        })
    }

    /// Download `file_id` into `dest`, picking one live replica at random.
    /// The written file is digest-checked against the overseer's metadata
    /// before the call returns.
    pub async fn download(
        &self,
        file_id: &str,
        dest: &Path,
        progress: ProgressSink,
    ) -> Result<DownloadReceipt> {
        let started = Instant::now();

        let overseer = self.pool.get(&self.config.overseer_addr).await?;
        let reply = overseer
            .request(
                PacketType::DownloadRequest,
                file_id.as_bytes().to_vec().into(),
            )
            .await?;
        let info: DownloadInfo = decode_payload(&response_to_result(reply)?.payload)?;

        let replica = info
            .replicas
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| Error::NotFound(format!("no live replica for file {}", file_id)))?;
        debug!(
            "downloading {} from {} ({} live replicas)",
            file_id,
            replica.addr(),
            info.replicas.len()
        );

        // dedicated connection: the pushed stream owns it until END
        let node = NodeClient::connect(&replica.addr(), self.config.transfer.request_timeout()).await?;
        let mut frames = node.register_transfer_sink().await;
        node.send(Packet::new(
            PacketType::DownloadRequest,
            node.next_correlation_id(),
            file_id.as_bytes().to_vec(),
        ))
        .await?;

        let result = receive_file(
            &mut frames,
            file_id,
            dest,
            &info,
            progress,
            self.config.transfer.request_timeout(),
        )
        .await;
        node.clear_transfer_sink().await;
        let summary = result?;

        let elapsed = started.elapsed();
        info!(
            "downloaded {} ({}) from {} in {:?}",
            file_id,
            format_bytes(summary.size_bytes),
            replica.node_id,
            elapsed
        );
        Ok(DownloadReceipt {
            file_id: file_id.to_string(),
            size_bytes: summary.size_bytes,
            source: replica.node_id.clone(),
            elapsed,
        })
    }
}

/// Drive the pushed HEAD/BODY/END stream into a local session. Any failure
/// abandons the session, so a broken download leaves no partial file.
async fn receive_file(
    frames: &mut mpsc::Receiver<Packet>,
    file_id: &str,
    dest: &Path,
    info: &DownloadInfo,
    progress: ProgressSink,
    stall_timeout: Duration,
) -> Result<TransferSummary> {
    let mut session: Option<TransferSession> = None;
    let result = drive_transfer(
        frames,
        file_id,
        dest,
        info,
        progress,
        stall_timeout,
        &mut session,
    )
    .await;
    if result.is_err() {
        if let Some(partial) = session.take() {
            partial.abandon().await;
        }
    }
    result
}

async fn drive_transfer(
    frames: &mut mpsc::Receiver<Packet>,
    file_id: &str,
    dest: &Path,
    info: &DownloadInfo,
    progress: ProgressSink,
    stall_timeout: Duration,
    session: &mut Option<TransferSession>,
) -> Result<TransferSummary> {
    let mut progress = Some(progress);
    loop {
        let frame = tokio::time::timeout(stall_timeout, frames.recv())
            .await
            .map_err(|_| Error::Timeout(format!("download of {} stalled", file_id)))?
            .ok_or(Error::ConnectionClosed)?;

        match frame.packet_type {
            PacketType::TransferFileHead => {
                if session.is_some() {
                    return Err(Error::Protocol("duplicate HEAD frame".into()));
                }
                let head: TransferHead = decode_payload(&frame.payload)?;
                if head.md5 != info.md5 {
                    return Err(Error::Protocol(
                        "replica offered a different digest than the metadata".into(),
                    ));
                }
                let sink = progress.take().unwrap_or_else(ProgressSink::disabled);
                *session = Some(
                    TransferSession::open(file_id, dest, info.md5, info.size_bytes, sink).await?,
                );
            }
            PacketType::TransferFileBody => {
                let shard: FileShard = decode_payload(&frame.payload)?;
                let active = session
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("BODY frame before HEAD".into()))?;
                active.append(&shard.data).await?;
            }
            PacketType::TransferFileEnd => {
                let active = session
                    .take()
                    .ok_or_else(|| Error::Protocol("END frame before HEAD".into()))?;
                return active.finish().await;
            }
            PacketType::Error => {
                return Err(Error::Remote(
                    String::from_utf8_lossy(&frame.payload).into_owned(),
                ));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected {:?} frame during download",
                    other
                )));
            }
        }
    }
}
