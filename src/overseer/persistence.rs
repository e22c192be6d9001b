//! Metadata durability: periodic dump and startup reload.
//!
//! The dump file is a back-to-back sequence of `{length: u32 BE, bincode
//! record}` entries. Every cycle rewrites the whole file via a sibling temp
//! file that is synced to disk before being renamed over the dump path, so
//! a crash mid-dump can never corrupt the previous dump. Loading walks the
//! entries until EOF or the first damaged one; a truncated or corrupt tail
//! keeps whatever loaded cleanly and never fails startup.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::common::error::{Error, Result};
use crate::overseer::metadata::{FileRecord, MetadataStore};

const LEN_PREFIX: usize = 4;

pub struct PersistenceManager {
    store: Arc<MetadataStore>,
    dump_path: PathBuf,
    interval: std::time::Duration,
}

impl PersistenceManager {
    pub fn new(
        store: Arc<MetadataStore>,
        dump_path: PathBuf,
        interval: std::time::Duration,
    ) -> PersistenceManager {
        PersistenceManager {
            store,
            dump_path,
            interval,
        }
    }

    pub fn dump_path(&self) -> &std::path::Path {
        &self.dump_path
    }

    /// Repopulate the store from the dump file. Returns how many records
    /// were loaded; a missing file is an empty store, not an error.
    pub async fn load(&self) -> Result<usize> {
        let bytes = match tokio::fs::read(&self.dump_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "read {}: {}",
                    self.dump_path.display(),
                    e
                )))
            }
        };

        let mut pos = 0usize;
        let mut loaded = 0usize;
        while pos < bytes.len() {
            if pos + LEN_PREFIX > bytes.len() {
                warn!(
                    "metadata dump truncated in a length prefix at offset {}, keeping {} records",
                    pos, loaded
                );
                break;
            }
            let len = u32::from_be_bytes([
                bytes[pos],
                bytes[pos + 1],
                bytes[pos + 2],
                bytes[pos + 3],
            ]) as usize;
            let start = pos + LEN_PREFIX;
            if start + len > bytes.len() {
                warn!(
                    "metadata dump truncated mid-record at offset {}, keeping {} records",
                    pos, loaded
                );
                break;
            }
            match bincode::deserialize::<FileRecord>(&bytes[start..start + len]) {
                Ok(record) => {
                    self.store.put(record).await;
                    loaded += 1;
                    pos = start + len;
                }
                Err(e) => {
                    warn!(
                        "corrupt metadata record at offset {} ({}), keeping {} records",
                        pos, e, loaded
                    );
                    break;
                }
            }
        }

        info!(
            "loaded {} metadata records from {}",
            loaded,
            self.dump_path.display()
        );
        Ok(loaded)
    }

    /// Write a full snapshot to the dump file. Returns the record count.
    pub async fn dump(&self) -> Result<usize> {
        let records = self.store.snapshot().await;

        let mut buf: Vec<u8> = Vec::new();
        for record in &records {
            let bytes = bincode::serialize(record)
                .map_err(|e| Error::Persistence(format!("serialize {}: {}", record.file_id, e)))?;
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(&bytes);
        }

        if let Some(parent) = self.dump_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Persistence(format!("mkdir {}: {}", parent.display(), e)))?;
        }

        let tmp_path = self.dump_path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path)
            .await
            .map_err(|e| Error::Persistence(format!("create {}: {}", tmp_path.display(), e)))?;
        tmp.write_all(&buf)
            .await
            .map_err(|e| Error::Persistence(format!("write {}: {}", tmp_path.display(), e)))?;
        tmp.flush()
            .await
            .map_err(|e| Error::Persistence(format!("flush {}: {}", tmp_path.display(), e)))?;
        // the rename must not become durable before the data blocks do
        tmp.sync_all()
            .await
            .map_err(|e| Error::Persistence(format!("sync {}: {}", tmp_path.display(), e)))?;
        drop(tmp);
        tokio::fs::rename(&tmp_path, &self.dump_path)
            .await
            .map_err(|e| Error::Persistence(format!("rename to {}: {}", self.dump_path.display(), e)))?;

        debug!(
            "dumped {} metadata records to {}",
            records.len(),
            self.dump_path.display()
        );
        Ok(records.len())
    }

    /// Dump on a fixed period until aborted. A failed cycle is logged and
    /// retried at the next tick.
    pub fn spawn_periodic(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.dump().await {
                    warn!("periodic metadata dump failed: {}", e);
                }
            }
        })
    }
}
