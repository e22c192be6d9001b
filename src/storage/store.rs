//! Local replica store for a storage node.
//!
//! Files land under the data directory fanned out into two levels of
//! hash-derived subdirectories so no single directory grows huge. The
//! in-memory table maps file id to path/size/digest and backs capacity
//! reporting and download serving. It is rebuilt empty on restart; the
//! coordinator's metadata is the durable record of who holds what.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::Mutex;

use crate::common::error::Result;
use crate::common::hash::md5_bytes;

/// One locally stored replica.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub md5: [u8; 16],
}

pub struct FileStore {
    data_dir: PathBuf,
    capacity_bytes: u64,
    files: Mutex<HashMap<String, StoredFile>>,
}

impl FileStore {
    pub async fn open(data_dir: PathBuf, capacity_bytes: u64) -> Result<FileStore> {
        tokio::fs::create_dir_all(&data_dir).await?;
        Ok(FileStore {
            data_dir,
            capacity_bytes,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Where a file id lives on disk: `data_dir/xx/yy/<file_id>`, with the
    /// two directory levels taken from the id's digest.
    pub fn locate(&self, file_id: &str) -> PathBuf {
        let digest = md5_bytes(file_id.as_bytes());
        self.data_dir
            .join(format!("{:02x}", digest[0]))
            .join(format!("{:02x}", digest[1]))
            .join(file_id)
    }

    pub async fn record(&self, file: StoredFile) {
        self.files.lock().await.insert(file.file_id.clone(), file);
    }

    pub async fn get(&self, file_id: &str) -> Option<StoredFile> {
        self.files.lock().await.get(file_id).cloned()
    }

    pub async fn used_bytes(&self) -> u64 {
        self.files.lock().await.values().map(|f| f.size_bytes).sum()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub async fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes().await)
    }

    pub async fn file_count(&self) -> usize {
        self.files.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_locate_is_stable_and_nested() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf(), 1000)
            .await
            .unwrap();

        let a = store.locate("file-1");
        let b = store.locate("file-1");
        assert_eq!(a, b);
        assert!(a.starts_with(dir.path()));
        // data_dir/level1/level2/file_id
        let relative = a.strip_prefix(dir.path()).unwrap();
        assert_eq!(relative.components().count(), 3);
    }

    #[tokio::test]
    async fn test_capacity_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf(), 1000)
            .await
            .unwrap();
        assert_eq!(store.free_bytes().await, 1000);

        store
            .record(StoredFile {
                file_id: "f1".into(),
                path: store.locate("f1"),
                size_bytes: 300,
                md5: [0u8; 16],
            })
            .await;
        store
            .record(StoredFile {
                file_id: "f2".into(),
                path: store.locate("f2"),
                size_bytes: 200,
                md5: [0u8; 16],
            })
            .await;

        assert_eq!(store.used_bytes().await, 500);
        assert_eq!(store.free_bytes().await, 500);
        assert_eq!(store.file_count().await, 2);
    }

    #[tokio::test]
    async fn test_free_never_underflows() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf(), 100).await.unwrap();
        store
            .record(StoredFile {
                file_id: "big".into(),
                path: store.locate("big"),
                size_bytes: 500,
                md5: [0u8; 16],
            })
            .await;
        assert_eq!(store.free_bytes().await, 0);
    }
}
