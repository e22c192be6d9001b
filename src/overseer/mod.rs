//! Coordinator: node registry, placement, file metadata, persistence, and
//! the server tying them together.

pub mod metadata;
pub mod persistence;
pub mod placement;
pub mod registry;
pub mod server;

pub use metadata::{FileRecord, MetadataStore};
pub use persistence::PersistenceManager;
pub use registry::{NodeRecord, NodeRegistry};
pub use server::{Overseer, RunningOverseer};
