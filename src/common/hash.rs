//! Content hashing for minidfs
//!
//! File integrity uses MD5 (16-byte digests baked into the wire format and
//! the metadata records). Hashing is incremental so a transfer never has to
//! re-read what it already wrote.

use std::path::Path;

use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

use crate::common::error::Result;

/// Incremental MD5 hasher for streamed transfers.
pub struct Md5Hasher {
    inner: Md5,
}

impl Md5Hasher {
    pub fn new() -> Md5Hasher {
        Md5Hasher { inner: Md5::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> [u8; 16] {
        self.inner.finalize().into()
    }
}

impl Default for Md5Hasher {
    fn default() -> Self {
        Md5Hasher::new()
    }
}

/// One-shot MD5 of an in-memory buffer.
pub fn md5_bytes(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// MD5 and size of a file, computed by streaming (64 KiB reads).
pub async fn md5_file(path: &Path) -> Result<([u8; 16], u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize(), total))
}

/// Render a digest for logs and CLI output.
pub fn hex_digest(digest: &[u8; 16]) -> String {
    hex::encode(digest)
}
