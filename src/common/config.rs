//! Configuration for minidfs components
//!
//! Each process has its own config struct with serde defaults, loadable from
//! a TOML file. Binaries layer CLI flags on top of whatever the file set.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::error::{Error, Result};

/// Transfer tuning shared by every component that moves file bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per BODY frame when streaming a file
    #[serde(default = "default_shard_size")]
    pub shard_size: u64,

    /// Timeout applied around every correlated request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_shard_size() -> u64 {
    4 * 1024 * 1024
}
fn default_request_timeout() -> u64 {
    10_000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            shard_size: default_shard_size(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl TransferConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverseerConfig {
    /// TCP bind address
    pub bind_addr: String,

    /// A node whose last heartbeat is older than this is dead
    pub heartbeat_timeout_ms: u64,

    /// Metadata dump period
    pub persist_interval_ms: u64,

    /// Metadata dump file
    pub dump_path: PathBuf,

    /// Replica count used when an upload request asks for zero
    pub default_replica_count: u32,

    pub transfer: TransferConfig,
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7500".to_string(),
            heartbeat_timeout_ms: 90_000,
            persist_interval_ms: 10_000,
            dump_path: PathBuf::from("./overseer-data/metadata.dump"),
            default_replica_count: 3,
            transfer: TransferConfig::default(),
        }
    }
}

impl OverseerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_config(path)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }
}

/// Storage-node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// TCP bind address
    pub bind_addr: String,

    /// Host peers use to reach this node
    pub advertise_host: String,

    /// Port peers use to reach this node; 0 means "whatever port the
    /// listener actually bound", which is what tests on port 0 rely on
    pub advertise_port: u16,

    /// Coordinator address
    pub overseer_addr: String,

    /// Directory file replicas are stored under
    pub data_dir: PathBuf,

    /// Advertised capacity; free space is capacity minus stored bytes
    pub capacity_bytes: u64,

    /// Liveness/capacity report period
    pub heartbeat_interval_ms: u64,

    pub transfer: TransferConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7600".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            advertise_port: 0,
            overseer_addr: "127.0.0.1:7500".to_string(),
            data_dir: PathBuf::from("./storage-data"),
            capacity_bytes: 64 * 1024 * 1024 * 1024,
            heartbeat_interval_ms: 30_000,
            transfer: TransferConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_config(path)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Coordinator address
    pub overseer_addr: String,

    pub transfer: TransferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            overseer_addr: "127.0.0.1:7500".to_string(),
            transfer: TransferConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_config(path)
    }
}

fn load_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        return Ok(T::default());
    };
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
    settings
        .try_deserialize()
        .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = OverseerConfig::default();
        assert_eq!(cfg.bind_addr, "127.0.0.1:7500");
        assert_eq!(cfg.transfer.shard_size, 4 * 1024 * 1024);
        assert_eq!(cfg.persist_interval(), Duration::from_secs(10));

        let cfg = StorageConfig::default();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.advertise_port, 0);
    }

    #[test]
    fn test_load_missing_path_is_default() {
        let cfg = ClientConfig::load(None).unwrap();
        assert_eq!(cfg.overseer_addr, ClientConfig::default().overseer_addr);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overseer.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "bind_addr = \"0.0.0.0:9000\"").unwrap();
        writeln!(f, "persist_interval_ms = 2500").unwrap();
        writeln!(f, "[transfer]").unwrap();
        writeln!(f, "shard_size = 65536").unwrap();

        let cfg = OverseerConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.persist_interval_ms, 2500);
        assert_eq!(cfg.transfer.shard_size, 65536);
        // untouched fields keep their defaults
        assert_eq!(cfg.heartbeat_timeout_ms, 90_000);
    }

    #[test]
    fn test_load_bad_toml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "bind_addr = [not toml").unwrap();
        assert!(OverseerConfig::load(Some(&path)).is_err());
    }
}
