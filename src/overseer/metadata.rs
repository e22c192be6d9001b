//! In-memory file metadata table.
//!
//! Records are created when an upload is granted and grow their replica
//! list as storage nodes confirm receipt. Nothing is ever deleted here;
//! durability comes from the persistence manager dumping snapshots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::common::error::{Error, Result};

/// Metadata for one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub md5: [u8; 16],
    pub desired_replica_count: u32,
    pub upload_timestamp_ms: u64,
    /// Node ids confirmed to hold a replica, in confirmation order.
    pub replica_node_ids: Vec<String>,
}

#[derive(Default)]
pub struct MetadataStore {
    files: Mutex<HashMap<String, FileRecord>>,
}

impl MetadataStore {
    pub fn new() -> MetadataStore {
        MetadataStore::default()
    }

    pub async fn put(&self, record: FileRecord) {
        self.files.lock().await.insert(record.file_id.clone(), record);
    }

    pub async fn get(&self, file_id: &str) -> Option<FileRecord> {
        self.files.lock().await.get(file_id).cloned()
    }

    /// Point-in-time copy of every record, ordered by file id so dumps are
    /// stable. Safe to iterate while the live table keeps mutating.
    pub async fn snapshot(&self) -> Vec<FileRecord> {
        let files = self.files.lock().await;
        let mut records: Vec<FileRecord> = files.values().cloned().collect();
        records.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        records
    }

    /// Record that `node_id` holds a replica of `file_id`. Idempotent per
    /// node id.
    pub async fn append_replica_node(&self, file_id: &str, node_id: &str) -> Result<()> {
        let mut files = self.files.lock().await;
        let record = files
            .get_mut(file_id)
            .ok_or_else(|| Error::NotFound(format!("file {}", file_id)))?;
        if !record.replica_node_ids.iter().any(|id| id == node_id) {
            record.replica_node_ids.push(node_id.to_string());
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.files.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.lock().await.is_empty()
    }
}
