//! Outbound connections: a correlated request client and a connection pool.
//!
//! A `NodeClient` owns one TCP connection. Its background read loop routes
//! inbound frames either to the correlation table (request/response traffic)
//! or, while a transfer sink is registered, to that sink (a peer pushing
//! HEAD/BODY/END at us). The `ClientPool` hands out shared clients keyed by
//! address, reusing healthy connections and evicting dead ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::common::error::{Error, Result};
use crate::common::packet::{Packet, PacketType};
use crate::net::connection::{split, FrameReader, FrameWriter};
use crate::net::correlator::RequestCorrelator;

type TransferSink = Arc<Mutex<Option<mpsc::Sender<Packet>>>>;

/// Turn a response frame into a `Result`: ERROR and FAIL frames carry a
/// UTF-8 message and become `Error::Remote`.
pub fn response_to_result(packet: Packet) -> Result<Packet> {
    match packet.packet_type {
        PacketType::Error | PacketType::Fail => Err(Error::Remote(
            String::from_utf8_lossy(&packet.payload).into_owned(),
        )),
        _ => Ok(packet),
    }
}

#[derive(Debug)]
pub struct NodeClient {
    addr: String,
    writer: FrameWriter,
    correlator: RequestCorrelator,
    transfer_sink: TransferSink,
    closed: Arc<AtomicBool>,
    read_task: JoinHandle<()>,
    request_timeout: Duration,
}

impl NodeClient {
    pub async fn connect(addr: &str, request_timeout: Duration) -> Result<NodeClient> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = split(stream);

        let correlator = RequestCorrelator::new();
        let transfer_sink: TransferSink = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));

        let read_task = tokio::spawn(read_loop(
            addr.to_string(),
            reader,
            correlator.clone(),
            transfer_sink.clone(),
            closed.clone(),
        ));

        Ok(NodeClient {
            addr: addr.to_string(),
            writer,
            correlator,
            transfer_sink,
            closed,
            read_task,
            request_timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Fresh correlation id for frames sent outside `request` (BODY streams,
    /// pushed transfers).
    pub fn next_correlation_id(&self) -> u32 {
        self.correlator.next_id()
    }

    /// Send one frame without waiting for anything back.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        if !self.is_healthy() {
            return Err(Error::ConnectionClosed);
        }
        self.writer.send(&packet).await
    }

    /// Correlated request with the client's default timeout.
    pub async fn request(&self, packet_type: PacketType, payload: Bytes) -> Result<Packet> {
        self.request_with_timeout(packet_type, payload, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        packet_type: PacketType,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Packet> {
        if !self.is_healthy() {
            return Err(Error::ConnectionClosed);
        }
        let id = self.correlator.next_id();
        let rx = self.correlator.register(id).await;

        if let Err(e) = self.writer.send(&Packet::new(packet_type, id, payload)).await {
            self.correlator.discard(id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.correlator.discard(id).await;
                Err(Error::Timeout(format!(
                    "no response from {} within {:?}",
                    self.addr, timeout
                )))
            }
        }
    }

    /// Route inbound transfer frames (and transfer-scoped errors) to the
    /// returned receiver instead of the correlation table. While the sink is
    /// registered the caller must not issue other requests on this
    /// connection; a pushed transfer owns the stream.
    pub async fn register_transfer_sink(&self) -> mpsc::Receiver<Packet> {
        let (tx, rx) = mpsc::channel(8);
        *self.transfer_sink.lock().await = Some(tx);
        rx
    }

    pub async fn clear_transfer_sink(&self) {
        self.transfer_sink.lock().await.take();
    }
}

impl Drop for NodeClient {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

async fn read_loop(
    addr: String,
    mut reader: FrameReader,
    correlator: RequestCorrelator,
    transfer_sink: TransferSink,
    closed: Arc<AtomicBool>,
) {
    loop {
        match reader.next_packet().await {
            Ok(Some(packet)) => {
                let sink_tx = {
                    let sink = transfer_sink.lock().await;
                    match sink.as_ref() {
                        Some(tx)
                            if packet.packet_type.is_transfer()
                                || packet.packet_type == PacketType::Error =>
                        {
                            Some(tx.clone())
                        }
                        _ => None,
                    }
                };
                match sink_tx {
                    Some(tx) => {
                        if tx.send(packet).await.is_err() {
                            debug!("transfer consumer for {} went away, dropping frame", addr);
                            transfer_sink.lock().await.take();
                        }
                    }
                    None => {
                        correlator.complete(packet).await;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("connection to {} broke: {}", addr, e);
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    correlator.fail_all().await;
    transfer_sink.lock().await.take();
}

/// Shared outbound connections keyed by `host:port`.
#[derive(Clone)]
pub struct ClientPool {
    request_timeout: Duration,
    clients: Arc<Mutex<HashMap<String, Arc<NodeClient>>>>,
}

impl ClientPool {
    pub fn new(request_timeout: Duration) -> ClientPool {
        ClientPool {
            request_timeout,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reuse the pooled connection to `addr` if it is still healthy,
    /// otherwise open a fresh one. Connecting happens outside the pool lock.
    pub async fn get(&self, addr: &str) -> Result<Arc<NodeClient>> {
        {
            let mut clients = self.clients.lock().await;
            match clients.get(addr) {
                Some(client) if client.is_healthy() => return Ok(client.clone()),
                Some(_) => {
                    clients.remove(addr);
                }
                None => {}
            }
        }

        let client = Arc::new(NodeClient::connect(addr, self.request_timeout).await?);
        self.clients
            .lock()
            .await
            .insert(addr.to_string(), client.clone());
        Ok(client)
    }

    pub async fn evict(&self, addr: &str) {
        self.clients.lock().await.remove(addr);
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}
