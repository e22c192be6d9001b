//! # minidfs
//!
//! A small distributed file store:
//! - One overseer tracks storage nodes and file metadata
//! - Storage nodes hold whole-file replicas and relay copies to each other
//! - A custom length-framed TCP protocol carries every exchange
//! - MD5 digests guard each transfer end to end
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────────┐
//!                │           Overseer           │
//!                │  node registry · placement   │
//!                │  file metadata · dump file   │
//!                └──────┬───────────────────────┘
//!     register /        │ heartbeat        ▲ replica
//!     heartbeat         │                  │ confirmations
//!   ┌───────────┬───────┴────┬─────────────┤
//!   │           │            │             │
//! ┌─▼────────┐ ┌▼─────────┐ ┌▼─────────┐   │
//! │ Storage 1 │ │ Storage 2 │ │ Storage 3 │──┘
//! │ replicas  │─▶ relay    │─▶ relay    │
//! └─────▲─────┘ └──────────┘ └──────────┘
//!       │ shard stream (HEAD/BODY/END)
//!   ┌───┴────┐
//!   │ Client │
//!   └────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the overseer
//! ```bash
//! minidfs-overseer serve \
//!   --bind 0.0.0.0:7500 \
//!   --dump ./overseer-data/metadata.dump
//! ```
//!
//! ### Start a storage node
//! ```bash
//! minidfs-storage serve \
//!   --bind 0.0.0.0:7600 \
//!   --data ./storage-data \
//!   --overseer localhost:7500
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Upload a file, three replicas
//! minidfs upload ./data.bin --replicas 3 --overseer localhost:7500
//!
//! # Download it back
//! minidfs download <file-id> --output ./out.bin
//! ```

pub mod client;
pub mod common;
pub mod net;
pub mod overseer;
pub mod storage;
pub mod transfer;

// Re-export commonly used types
pub use client::{DfsClient, DownloadReceipt, UploadReceipt};
pub use common::config::{ClientConfig, OverseerConfig, StorageConfig};
pub use common::{Error, Result};
pub use overseer::Overseer;
pub use storage::StorageNode;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
