//! Networking: framed connections, request correlation, pooled clients.

pub mod client;
pub mod connection;
pub mod correlator;

pub use client::{response_to_result, ClientPool, NodeClient};
pub use connection::{split, FrameReader, FrameWriter};
pub use correlator::RequestCorrelator;
