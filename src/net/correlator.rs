//! Request/response correlation.
//!
//! Each outbound request takes a fresh id from a per-connection counter and
//! parks a oneshot sender in the table. The read loop completes entries as
//! responses arrive. An entry is matched and removed exactly once; a late or
//! duplicate response is a logged no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::common::packet::Packet;

#[derive(Clone, Debug, Default)]
pub struct RequestCorrelator {
    next_id: Arc<AtomicU32>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Packet>>>>,
}

impl RequestCorrelator {
    pub fn new() -> RequestCorrelator {
        RequestCorrelator {
            next_id: Arc::new(AtomicU32::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Monotonically increasing id, unique per connection.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Park a waiter for `id`. The receiver resolves when a response with
    /// that correlation id arrives, or errors when the connection dies.
    pub async fn register(&self, id: u32) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    /// Complete the waiter for this packet's correlation id. Returns false
    /// if nobody is waiting (late reply, or an id we never issued).
    pub async fn complete(&self, packet: Packet) -> bool {
        let sender = self.pending.lock().await.remove(&packet.correlation_id);
        match sender {
            Some(tx) => tx.send(packet).is_ok(),
            None => {
                debug!(
                    "no pending request for correlation id {}",
                    packet.correlation_id
                );
                false
            }
        }
    }

    /// Forget a waiter (caller timed out).
    pub async fn discard(&self, id: u32) {
        self.pending.lock().await.remove(&id);
    }

    /// Drop every waiter; their receivers observe a closed channel. Called
    /// when the connection goes away.
    pub async fn fail_all(&self) {
        self.pending.lock().await.clear();
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::packet::PacketType;

    #[tokio::test]
    async fn test_complete_exactly_once() {
        let correlator = RequestCorrelator::new();
        let id = correlator.next_id();
        let rx = correlator.register(id).await;

        assert!(
            correlator
                .complete(Packet::empty(PacketType::Success, id))
                .await
        );
        // second completion for the same id is a no-op
        assert!(
            !correlator
                .complete(Packet::empty(PacketType::Success, id))
                .await
        );

        let packet = rx.await.unwrap();
        assert_eq!(packet.packet_type, PacketType::Success);
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_ids_increase() {
        let correlator = RequestCorrelator::new();
        let a = correlator.next_id();
        let b = correlator.next_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let correlator = RequestCorrelator::new();
        let rx = correlator.register(correlator.next_id()).await;
        correlator.fail_all().await;
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_discard_then_response_is_noop() {
        let correlator = RequestCorrelator::new();
        let id = correlator.next_id();
        let _rx = correlator.register(id).await;
        correlator.discard(id).await;
        assert!(
            !correlator
                .complete(Packet::empty(PacketType::Success, id))
                .await
        );
    }
}
