//! Storage node: replica persistence, transfer intake, downloads, relays.

pub(crate) mod node;
pub mod relay;
pub mod server;
pub mod store;

pub use relay::{relay_file, RelayOutcome};
pub use server::{RunningStorageNode, StorageNode};
pub use store::{FileStore, StoredFile};
