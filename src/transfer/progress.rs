//! Transfer progress reporting.
//!
//! Progress events may fire zero or more times during a transfer; the
//! terminal success/failure is always the operation's `Result`, produced
//! exactly once. Emission never blocks the transfer, and a consumer that
//! stopped listening is simply ignored.

use tokio::sync::mpsc;

/// A point-in-time progress report for one file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub bytes_done: u64,
    pub total_bytes: u64,
}

impl ProgressEvent {
    /// Whole percentage, `bytes_done * 100 / total_bytes`. An empty file
    /// reports 100.
    pub fn percent(&self) -> u64 {
        if self.total_bytes == 0 {
            100
        } else {
            self.bytes_done * 100 / self.total_bytes
        }
    }
}

/// Where a session or splitter sends its progress events.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    /// A sink that drops everything. Servers use this; only interactive
    /// callers subscribe.
    pub fn disabled() -> ProgressSink {
        ProgressSink { tx: None }
    }

    /// A sink plus the receiver a consumer drains.
    pub fn channel() -> (ProgressSink, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProgressSink { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, bytes_done: u64, total_bytes: u64) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent {
                bytes_done,
                total_bytes,
            });
        }
    }
}
