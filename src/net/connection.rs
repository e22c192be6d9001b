//! Framed TCP connection halves.
//!
//! A `TcpStream` splits into a `FrameReader` (owned by exactly one read
//! loop) and a cloneable `FrameWriter` (shared by whoever needs to send).
//! Writes serialize whole frames under a lock so concurrent senders never
//! interleave partial frames.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::common::error::{Error, Result};
use crate::common::packet::{FrameDecoder, Packet};

pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (FrameReader::new(read), FrameWriter::new(write))
}

pub struct FrameReader {
    read: OwnedReadHalf,
    decoder: FrameDecoder,
}

impl FrameReader {
    pub fn new(read: OwnedReadHalf) -> FrameReader {
        FrameReader {
            read,
            decoder: FrameDecoder::new(),
        }
    }

    /// Next complete frame. `Ok(None)` is a clean EOF on a frame boundary;
    /// EOF mid-frame and any decode failure are errors, and the connection
    /// must not be read again afterwards.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = self.decoder.decode()? {
                return Ok(Some(packet));
            }
            let n = self.read.read_buf(self.decoder.buffer()).await?;
            if n == 0 {
                if self.decoder.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol("connection closed mid-frame".into()));
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct FrameWriter {
    write: Arc<Mutex<OwnedWriteHalf>>,
}

impl FrameWriter {
    pub fn new(write: OwnedWriteHalf) -> FrameWriter {
        FrameWriter {
            write: Arc::new(Mutex::new(write)),
        }
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let bytes = packet.encode()?;
        let mut write = self.write.lock().await;
        write.write_all(&bytes).await?;
        write.flush().await?;
        Ok(())
    }
}
