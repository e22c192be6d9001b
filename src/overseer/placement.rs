//! Capacity-aware replica placement.
//!
//! Two-pass heuristic over the alive set: nodes whose projected utilization
//! after taking the file sits strictly below the fleet mean are picked
//! first, then the remainder fills up from the rest. Candidates are stable
//! sorted by (projected ratio, node id) before both passes, so identical
//! registry state always yields identical placements. Index 0 of the result
//! is the upload target; the rest are relay targets.

use std::cmp::Ordering;

use crate::common::error::{Error, Result};
use crate::overseer::registry::NodeRecord;

/// Choose `replica_count` nodes for a file of `size_bytes`.
pub fn select(
    alive: &[NodeRecord],
    replica_count: usize,
    size_bytes: u64,
) -> Result<Vec<NodeRecord>> {
    if replica_count == 0 {
        return Err(Error::InvalidRequest("replica count must be positive".into()));
    }
    if alive.len() < replica_count {
        return Err(Error::InsufficientCapacity {
            needed: replica_count,
            available: alive.len(),
        });
    }

    let mut scored: Vec<(f64, &NodeRecord)> = alive
        .iter()
        .map(|n| (projected_ratio(n, size_bytes), n))
        .collect();
    scored.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.node_id.cmp(&b.1.node_id))
    });

    let mean = scored.iter().map(|(r, _)| r).sum::<f64>() / scored.len() as f64;

    let mut picked: Vec<NodeRecord> = scored
        .iter()
        .filter(|(ratio, _)| *ratio < mean)
        .take(replica_count)
        .map(|(_, n)| (*n).clone())
        .collect();

    if picked.len() < replica_count {
        for (_, node) in &scored {
            if picked.iter().any(|p| p.node_id == node.node_id) {
                continue;
            }
            picked.push((*node).clone());
            if picked.len() == replica_count {
                break;
            }
        }
    }

    if picked.len() < replica_count {
        return Err(Error::InsufficientCapacity {
            needed: replica_count,
            available: picked.len(),
        });
    }
    Ok(picked)
}

/// Utilization this node would have after storing the file. A node
/// reporting zero total capacity counts as full.
fn projected_ratio(node: &NodeRecord, size_bytes: u64) -> f64 {
    let capacity = node.used_bytes + node.free_bytes;
    if capacity == 0 {
        return 1.0;
    }
    (node.used_bytes + size_bytes) as f64 / capacity as f64
}
