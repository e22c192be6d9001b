//! Common plumbing shared across minidfs

pub mod config;
pub mod error;
pub mod hash;
pub mod packet;
pub mod payload;
pub mod utils;

pub use config::{ClientConfig, OverseerConfig, StorageConfig, TransferConfig};
pub use error::{Error, Result};
pub use hash::{hex_digest, md5_bytes, md5_file, Md5Hasher};
pub use packet::{FrameDecoder, Packet, PacketType, HEADER_LEN, MAGIC, MAX_FRAME_LEN};
pub use payload::{decode_payload, decode_text, encode_payload, NodeAddr, NodeReport};
pub use utils::{format_bytes, new_file_id, new_node_id, timestamp_now_millis};
