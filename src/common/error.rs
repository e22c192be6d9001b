//! Error types for minidfs

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Protocol Errors (fatal to the connection) ===
    #[error("Bad frame magic: expected {expected:#06x}, got {actual:#06x}")]
    BadMagic { expected: u16, actual: u16 },

    #[error("Frame too large: {length} bytes (max {max})")]
    FrameTooLarge { length: u32, max: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Payload codec error: {0}")]
    Codec(String),

    // === Validation Errors (caller gets an ERROR response) ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Transfer Errors ===
    #[error("Integrity mismatch: expected md5 {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("No active transfer for file {0}")]
    SessionNotFound(String),

    // === Registry / Placement Errors ===
    #[error("Node id {node_id} already registered at {addr}")]
    NodeConflict { node_id: String, addr: String },

    #[error("Heartbeat rejected for node {0}: unknown id or address mismatch")]
    HeartbeatMismatch(String),

    #[error("Insufficient capacity: need {needed} live nodes, have {available}")]
    InsufficientCapacity { needed: usize, available: usize },

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Remote error: {0}")]
    Remote(String),

    // === Persistence Errors ===
    #[error("Persistence error: {0}")]
    Persistence(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error? Used by the replication relay to decide
    /// whether a failed hop may simply be tried on the next candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::ConnectionClosed
                | Error::Remote(_)
        )
    }

    /// Is this error fatal to the connection it occurred on?
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Error::BadMagic { .. } | Error::FrameTooLarge { .. } | Error::Protocol(_) | Error::Io(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
