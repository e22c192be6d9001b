//! Structured frame payloads and their codec.
//!
//! Payloads are serde types serialized with bincode behind two free
//! functions, so the frame layer never assumes a specific codec. Two frames
//! carry raw bytes instead of a structured payload: DOWNLOAD_REQUEST (the
//! UTF-8 file id) and ERROR/FAIL (a UTF-8 message).

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::error::{Error, Result};

/// Network identity of a storage node, as handed to clients and relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddr {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Identity plus capacity, sent by a storage node when registering and on
/// every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    pub size_bytes: u64,
    pub md5: [u8; 16],
    pub replica_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_id: String,
    /// Index 0 is the upload target; the rest are relay targets.
    pub placements: Vec<NodeAddr>,
}

/// First frame of a file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHead {
    pub file_id: String,
    pub md5: [u8; 16],
    pub total_size: u64,
    pub shard_count: u32,
}

/// One BODY frame worth of file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileShard {
    pub file_id: String,
    pub data: Vec<u8>,
}

/// Last frame of a file transfer. On the upload path it carries the replica
/// targets the receiver is expected to keep relaying to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEnd {
    pub file_id: String,
    pub remaining_targets: Vec<NodeAddr>,
}

/// Coordinator's answer to a download request: where the file lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub file_id: String,
    pub md5: [u8; 16],
    pub size_bytes: u64,
    pub replicas: Vec<NodeAddr>,
}

/// Storage node telling the coordinator it now holds a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaUpdate {
    pub file_id: String,
    pub node_id: String,
    pub size_bytes: u64,
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes> {
    let bytes = bincode::serialize(value)?;
    Ok(Bytes::from(bytes))
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Decode a raw UTF-8 payload (download requests, error messages).
pub fn decode_text(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|e| Error::Codec(format!("payload is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let request = UploadRequest {
            filename: "report.pdf".into(),
            size_bytes: 1 << 20,
            md5: [7u8; 16],
            replica_count: 3,
        };
        let bytes = encode_payload(&request).unwrap();
        let decoded: UploadRequest = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_node_addr_display() {
        let addr = NodeAddr {
            node_id: "n1".into(),
            host: "10.0.0.5".into(),
            port: 7600,
        };
        assert_eq!(addr.addr(), "10.0.0.5:7600");
    }

    #[test]
    fn test_decode_garbage_fails() {
        let r: Result<UploadResponse> = decode_payload(&[0xFF, 0x01]);
        assert!(r.is_err());
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(b"abc-123").unwrap(), "abc-123");
        assert!(decode_text(&[0xC0, 0x80]).is_err());
    }
}
