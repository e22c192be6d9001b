//! Store-and-forward replication relay.
//!
//! After a node finishes receiving a file it forwards the bytes to the
//! first reachable remaining target, handing that target the rest of the
//! list inside the END frame so the new holder keeps the relay going. A
//! failed hop goes to the back of the worklist; attempts are capped at the
//! initial worklist length, so each candidate is tried at most once per
//! invocation. Exhausting every candidate is accepted: replication is
//! best-effort and the file stays on whoever already confirmed it.

use std::collections::VecDeque;

use tracing::{info, warn};

use crate::common::error::Result;
use crate::common::packet::{Packet, PacketType};
use crate::common::payload::{encode_payload, FileShard, NodeAddr, TransferEnd, TransferHead};
use crate::net::client::{response_to_result, ClientPool};
use crate::storage::store::StoredFile;
use crate::transfer::progress::ProgressSink;
use crate::transfer::splitter::ShardSplitter;

/// What a relay invocation accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Node that accepted the file, if any hop succeeded.
    pub delivered_to: Option<String>,
    /// Hops tried, successful one included.
    pub attempts: usize,
}

/// Forward `stored` to one of `targets`, passing the leftovers along.
pub async fn relay_file(
    pool: &ClientPool,
    stored: &StoredFile,
    targets: Vec<NodeAddr>,
    shard_size: usize,
) -> RelayOutcome {
    let mut worklist: VecDeque<NodeAddr> = targets.into();
    let max_attempts = worklist.len();
    let mut attempts = 0;

    while attempts < max_attempts {
        let Some(target) = worklist.pop_front() else {
            break;
        };
        attempts += 1;

        let remaining: Vec<NodeAddr> = worklist.iter().cloned().collect();
        match send_to_hop(pool, stored, &target, &remaining, shard_size).await {
            Ok(()) => {
                info!(
                    "relayed {} to {} (attempt {}/{})",
                    stored.file_id, target.node_id, attempts, max_attempts
                );
                return RelayOutcome {
                    delivered_to: Some(target.node_id),
                    attempts,
                };
            }
            Err(e) => {
                warn!(
                    "relay hop {} for {} failed: {}",
                    target.node_id, stored.file_id, e
                );
                pool.evict(&target.addr()).await;
                worklist.push_back(target);
            }
        }
    }

    if attempts > 0 {
        warn!(
            "replication of {} gave up after {} attempts",
            stored.file_id, attempts
        );
    }
    RelayOutcome {
        delivered_to: None,
        attempts,
    }
}

async fn send_to_hop(
    pool: &ClientPool,
    stored: &StoredFile,
    target: &NodeAddr,
    remaining: &[NodeAddr],
    shard_size: usize,
) -> Result<()> {
    let client = pool.get(&target.addr()).await?;

    let mut splitter =
        ShardSplitter::open(&stored.path, shard_size, ProgressSink::disabled()).await?;
    let head = TransferHead {
        file_id: stored.file_id.clone(),
        md5: stored.md5,
        total_size: stored.size_bytes,
        shard_count: splitter.shard_count(),
    };
    let reply = client
        .request(PacketType::TransferFileHead, encode_payload(&head)?)
        .await?;
    response_to_result(reply)?;

    while let Some(shard) = splitter.next_shard().await? {
        let body = FileShard {
            file_id: stored.file_id.clone(),
            data: shard.to_vec(),
        };
        client
            .send(Packet::new(
                PacketType::TransferFileBody,
                client.next_correlation_id(),
                encode_payload(&body)?,
            ))
            .await?;
    }

    let end = TransferEnd {
        file_id: stored.file_id.clone(),
        remaining_targets: remaining.to_vec(),
    };
    let reply = client
        .request(PacketType::TransferFileEnd, encode_payload(&end)?)
        .await?;
    response_to_result(reply)?;
    Ok(())
}
