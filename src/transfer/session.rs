//! Receiving side of a file transfer.
//!
//! A session is created by a HEAD frame, fed by BODY frames, and finalized
//! by END. The content hash runs incrementally as bytes land, so END only
//! compares digests. A session abandoned before END leaves nothing behind:
//! the partial file is deleted and never counts as a replica.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::common::error::{Error, Result};
use crate::common::hash::{hex_digest, Md5Hasher};
use crate::transfer::progress::ProgressSink;

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferSummary {
    pub size_bytes: u64,
    pub elapsed: Duration,
}

/// One in-flight inbound file transfer.
pub struct TransferSession {
    file_id: String,
    dest_path: PathBuf,
    expected_md5: [u8; 16],
    expected_size: u64,
    bytes_written: u64,
    hasher: Md5Hasher,
    file: File,
    started_at: Instant,
    progress: ProgressSink,
}

impl TransferSession {
    /// Open the destination file (creating parent directories) and start a
    /// session.
    pub async fn open(
        file_id: impl Into<String>,
        dest_path: impl Into<PathBuf>,
        expected_md5: [u8; 16],
        expected_size: u64,
        progress: ProgressSink,
    ) -> Result<TransferSession> {
        let file_id = file_id.into();
        let dest_path = dest_path.into();

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Storage(format!(
                    "cannot create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let file = File::create(&dest_path)
            .await
            .map_err(|e| Error::Storage(format!("cannot open {}: {}", dest_path.display(), e)))?;

        debug!(
            "transfer {} started, expecting {} bytes into {}",
            file_id,
            expected_size,
            dest_path.display()
        );

        Ok(TransferSession {
            file_id,
            dest_path,
            expected_md5,
            expected_size,
            bytes_written: 0,
            hasher: Md5Hasher::new(),
            file,
            started_at: Instant::now(),
            progress,
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn expected_md5(&self) -> [u8; 16] {
        self.expected_md5
    }

    /// Append one BODY frame worth of bytes. Chunks are strictly sequential;
    /// the sender owns ordering.
    pub async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| Error::Storage(format!("write to {}: {}", self.dest_path.display(), e)))?;
        self.hasher.update(chunk);
        self.bytes_written += chunk.len() as u64;
        self.progress.emit(self.bytes_written, self.expected_size);
        Ok(())
    }

    /// Finalize on END: flush, then verify the digest. On a mismatch the
    /// file is deleted and `IntegrityMismatch` returned.
    pub async fn finish(mut self) -> Result<TransferSummary> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::Storage(format!("flush {}: {}", self.dest_path.display(), e)))?;
        drop(self.file);

        let actual = self.hasher.finalize();
        if actual != self.expected_md5 {
            if let Err(e) = tokio::fs::remove_file(&self.dest_path).await {
                warn!(
                    "could not remove corrupt file {}: {}",
                    self.dest_path.display(),
                    e
                );
            }
            return Err(Error::IntegrityMismatch {
                expected: hex_digest(&self.expected_md5),
                actual: hex_digest(&actual),
            });
        }

        Ok(TransferSummary {
            size_bytes: self.bytes_written,
            elapsed: self.started_at.elapsed(),
        })
    }

    /// Drop an unfinished transfer: close the handle and delete the partial
    /// file.
    pub async fn abandon(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.dest_path).await {
            warn!(
                "could not remove partial file {}: {}",
                self.dest_path.display(),
                e
            );
        }
        warn!(
            "transfer {} abandoned after {} bytes",
            self.file_id, self.bytes_written
        );
    }
}

/// A claimed file id: reserved before its file is opened, or checked out
/// for appending.
enum SessionSlot {
    Busy,
    Ready(TransferSession),
}

/// Node-wide table of in-flight inbound transfers, one per file id.
///
/// A file id is claimed with `reserve` before the destination file is ever
/// opened, so a competing HEAD can never truncate a file another session is
/// writing. Sessions are checked out with `take` before any awaited file
/// I/O and put back with `restore`; the id stays claimed in between, and
/// `release` frees it once the transfer ends either way.
#[derive(Clone, Default)]
pub struct SessionMap {
    inner: Arc<Mutex<HashMap<String, SessionSlot>>>,
}

impl SessionMap {
    pub fn new() -> SessionMap {
        SessionMap::default()
    }

    /// Claim a file id ahead of opening its destination file. Fails if the
    /// id already has a transfer in flight.
    pub async fn reserve(&self, file_id: &str) -> Result<()> {
        let mut map = self.inner.lock().await;
        if map.contains_key(file_id) {
            return Err(Error::InvalidRequest(format!(
                "transfer already in progress for file {}",
                file_id
            )));
        }
        map.insert(file_id.to_string(), SessionSlot::Busy);
        Ok(())
    }

    /// Take a session out for I/O; the id stays claimed until `restore` or
    /// `release`.
    pub async fn take(&self, file_id: &str) -> Option<TransferSession> {
        let mut map = self.inner.lock().await;
        let slot = map.get_mut(file_id)?;
        match std::mem::replace(slot, SessionSlot::Busy) {
            SessionSlot::Ready(session) => Some(session),
            SessionSlot::Busy => None,
        }
    }

    /// Fill a claimed slot with its session, after `reserve` or `take`.
    pub async fn restore(&self, session: TransferSession) {
        self.inner
            .lock()
            .await
            .insert(session.file_id().to_string(), SessionSlot::Ready(session));
    }

    /// Free a file id whose transfer finished, failed, or was abandoned.
    pub async fn release(&self, file_id: &str) {
        self.inner.lock().await.remove(file_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::hash::md5_bytes;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_successful_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b/file.bin");
        let data = vec![0x42u8; 10_000];

        let (sink, mut rx) = ProgressSink::channel();
        let mut session = TransferSession::open(
            "f1",
            &dest,
            md5_bytes(&data),
            data.len() as u64,
            sink,
        )
        .await
        .unwrap();

        for chunk in data.chunks(1024) {
            session.append(chunk).await.unwrap();
        }
        let summary = session.finish().await.unwrap();
        assert_eq!(summary.size_bytes, data.len() as u64);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.bytes_done, 1024);
        assert_eq!(first.total_bytes, data.len() as u64);
    }

    #[tokio::test]
    async fn test_integrity_mismatch_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        let data = b"expected content".to_vec();

        let mut session = TransferSession::open(
            "f2",
            &dest,
            md5_bytes(&data),
            data.len() as u64,
            ProgressSink::disabled(),
        )
        .await
        .unwrap();

        session.append(b"something else!!").await.unwrap();
        match session.finish().await {
            Err(Error::IntegrityMismatch { .. }) => {}
            other => panic!("expected IntegrityMismatch, got {:?}", other.map(|_| ())),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_abandon_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("partial.bin");

        let mut session =
            TransferSession::open("f3", &dest, [0u8; 16], 100, ProgressSink::disabled())
                .await
                .unwrap();
        session.append(b"half").await.unwrap();
        assert!(dest.exists());

        session.abandon().await;
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_session_map_one_per_file_id() {
        let dir = tempfile::tempdir().unwrap();
        let map = SessionMap::new();

        tokio_test::assert_ok!(map.reserve("dup").await);
        assert!(matches!(
            map.reserve("dup").await,
            Err(Error::InvalidRequest(_))
        ));

        let session = TransferSession::open(
            "dup",
            dir.path().join("one.bin"),
            [0u8; 16],
            1,
            ProgressSink::disabled(),
        )
        .await
        .unwrap();
        map.restore(session).await;
        assert_eq!(map.len().await, 1);

        let taken = map.take("dup").await.unwrap();
        // the id stays claimed while the session is checked out
        assert!(map.take("dup").await.is_none());
        assert!(matches!(
            map.reserve("dup").await,
            Err(Error::InvalidRequest(_))
        ));
        map.restore(taken).await;
        assert_eq!(map.len().await, 1);
    }

    #[tokio::test]
    async fn test_released_id_can_be_reserved_again() {
        let map = SessionMap::new();
        map.reserve("f9").await.unwrap();
        map.release("f9").await;
        assert!(map.is_empty().await);
        tokio_test::assert_ok!(map.reserve("f9").await);
    }
}
