//! Storage-node registry: identity, capacity, liveness.
//!
//! Nodes register once and then refresh themselves with heartbeats. Records
//! are never deleted; a node whose last heartbeat is older than the timeout
//! is simply dead to placement and downloads until it reports again.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::common::error::{Error, Result};
use crate::common::payload::{NodeAddr, NodeReport};
use crate::common::utils::timestamp_now_millis;

/// Registry view of one storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub last_heartbeat_ms: u64,
}

impl NodeRecord {
    pub fn from_report(report: &NodeReport, now_ms: u64) -> NodeRecord {
        NodeRecord {
            node_id: report.node_id.clone(),
            host: report.host.clone(),
            port: report.port,
            used_bytes: report.used_bytes,
            free_bytes: report.free_bytes,
            last_heartbeat_ms: now_ms,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn to_node_addr(&self) -> NodeAddr {
        NodeAddr {
            node_id: self.node_id.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn is_alive(&self, now_ms: u64, timeout: Duration) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_ms) < timeout.as_millis() as u64
    }

    fn same_endpoint(&self, report: &NodeReport) -> bool {
        self.host == report.host && self.port == report.port
    }
}

pub struct NodeRegistry {
    heartbeat_timeout: Duration,
    nodes: Mutex<HashMap<String, NodeRecord>>,
}

impl NodeRegistry {
    pub fn new(heartbeat_timeout: Duration) -> NodeRegistry {
        NodeRegistry {
            heartbeat_timeout,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Register a node. Accepted if the id is new, the existing record is
    /// stale, or the same endpoint is re-registering. A different live node
    /// on the same id is a conflict and leaves the record untouched.
    pub async fn register(&self, report: &NodeReport) -> Result<()> {
        self.register_at(report, timestamp_now_millis()).await
    }

    pub async fn register_at(&self, report: &NodeReport, now_ms: u64) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        match nodes.get(&report.node_id) {
            Some(existing)
                if existing.is_alive(now_ms, self.heartbeat_timeout)
                    && !existing.same_endpoint(report) =>
            {
                warn!(
                    "rejecting registration of node {}: live node already registered at {}",
                    report.node_id,
                    existing.addr()
                );
                Err(Error::NodeConflict {
                    node_id: report.node_id.clone(),
                    addr: existing.addr(),
                })
            }
            _ => {
                info!(
                    "storage node {} registered at {}:{} ({} free)",
                    report.node_id,
                    report.host,
                    report.port,
                    crate::common::utils::format_bytes(report.free_bytes)
                );
                nodes.insert(
                    report.node_id.clone(),
                    NodeRecord::from_report(report, now_ms),
                );
                Ok(())
            }
        }
    }

    /// Refresh liveness and capacity. Fails, without touching the record,
    /// for an unknown id or an endpoint that does not match the one
    /// registered.
    pub async fn heartbeat(&self, report: &NodeReport) -> Result<()> {
        self.heartbeat_at(report, timestamp_now_millis()).await
    }

    pub async fn heartbeat_at(&self, report: &NodeReport, now_ms: u64) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        match nodes.get_mut(&report.node_id) {
            None => Err(Error::HeartbeatMismatch(report.node_id.clone())),
            Some(record) if !record.same_endpoint(report) => {
                warn!(
                    "heartbeat for node {} from {}:{} does not match registered {}",
                    report.node_id,
                    report.host,
                    report.port,
                    record.addr()
                );
                Err(Error::HeartbeatMismatch(report.node_id.clone()))
            }
            Some(record) => {
                record.used_bytes = report.used_bytes;
                record.free_bytes = report.free_bytes;
                record.last_heartbeat_ms = now_ms;
                Ok(())
            }
        }
    }

    /// Snapshot of every node with a fresh heartbeat, ordered by node id.
    pub async fn list_alive(&self) -> Vec<NodeRecord> {
        self.list_alive_at(timestamp_now_millis()).await
    }

    pub async fn list_alive_at(&self, now_ms: u64) -> Vec<NodeRecord> {
        let nodes = self.nodes.lock().await;
        let mut alive: Vec<NodeRecord> = nodes
            .values()
            .filter(|n| n.is_alive(now_ms, self.heartbeat_timeout))
            .cloned()
            .collect();
        alive.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        alive
    }

    /// The subset of `node_ids` that is currently alive, ordered by node id.
    pub async fn get_alive(&self, node_ids: &[String]) -> Vec<NodeRecord> {
        self.get_alive_at(node_ids, timestamp_now_millis()).await
    }

    pub async fn get_alive_at(&self, node_ids: &[String], now_ms: u64) -> Vec<NodeRecord> {
        let nodes = self.nodes.lock().await;
        let mut alive: Vec<NodeRecord> = node_ids
            .iter()
            .filter_map(|id| nodes.get(id))
            .filter(|n| n.is_alive(now_ms, self.heartbeat_timeout))
            .cloned()
            .collect();
        alive.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        alive
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.lock().await.len()
    }
}
