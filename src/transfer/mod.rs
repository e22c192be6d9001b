//! File transfer machinery: the receiving state machine, the sending
//! splitter, and progress reporting shared by both.

pub mod progress;
pub mod session;
pub mod splitter;

pub use progress::{ProgressEvent, ProgressSink};
pub use session::{SessionMap, TransferSession, TransferSummary};
pub use splitter::ShardSplitter;
