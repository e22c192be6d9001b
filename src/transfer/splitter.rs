//! Sending side of a file transfer.
//!
//! Streams a file as fixed-size shards without ever buffering the whole
//! file. The last shard may be shorter; an empty file yields no shards.

use std::path::Path;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::common::error::Result;
use crate::transfer::progress::ProgressSink;

pub struct ShardSplitter {
    file: File,
    shard_size: usize,
    total_size: u64,
    bytes_read: u64,
    progress: ProgressSink,
}

impl ShardSplitter {
    pub async fn open(
        path: &Path,
        shard_size: usize,
        progress: ProgressSink,
    ) -> Result<ShardSplitter> {
        let file = File::open(path).await?;
        let total_size = file.metadata().await?.len();
        Ok(ShardSplitter {
            file,
            shard_size,
            total_size,
            bytes_read: 0,
            progress,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Number of BODY frames this file will produce.
    pub fn shard_count(&self) -> u32 {
        self.total_size.div_ceil(self.shard_size as u64) as u32
    }

    /// Read the next shard; `None` once the file is exhausted. Short reads
    /// are accumulated until the shard is full or EOF.
    pub async fn next_shard(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(self.shard_size);
        while buf.len() < self.shard_size {
            let n = self.file.read_buf(&mut buf).await?;
            if n == 0 {
                break;
            }
        }
        if buf.is_empty() {
            return Ok(None);
        }
        self.bytes_read += buf.len() as u64;
        self.progress.emit(self.bytes_read, self.total_size);
        Ok(Some(buf.freeze()))
    }
}
