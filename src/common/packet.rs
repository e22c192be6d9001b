//! Wire frame layout and stream framing.
//!
//! Every message on the wire is one frame:
//!
//! ```text
//! magic:u16 | total_length:u32 | type:u16 | correlation_id:u32 | payload
//! ```
//!
//! All integers are big-endian. `total_length` covers the 12-byte header plus
//! the payload. A bad magic or an oversized length is unrecoverable for the
//! stream it was read from; the connection must be closed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::error::{Error, Result};

/// Frame magic, first two bytes of every frame.
pub const MAGIC: u16 = 0x5DF5;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 12;

/// Largest allowed payload (128 MiB).
pub const MAX_PAYLOAD_LEN: u32 = 128 * 1024 * 1024;

/// Largest allowed frame, header included.
pub const MAX_FRAME_LEN: u32 = HEADER_LEN as u32 + MAX_PAYLOAD_LEN;

/// Message kind carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    HeartBeat = 1,
    StorageRegister = 2,
    StorageRegisterResponse = 3,
    TransferFileHead = 4,
    TransferFileBody = 5,
    TransferFileEnd = 6,
    TransferResponse = 7,
    DownloadRequest = 8,
    UploadRequest = 10,
    UploadResponse = 11,
    UpdateFileMetaStorage = 12,
    Success = 20,
    Fail = 21,
    Error = 22,
}

impl PacketType {
    pub fn from_u16(raw: u16) -> Option<PacketType> {
        match raw {
            1 => Some(PacketType::HeartBeat),
            2 => Some(PacketType::StorageRegister),
            3 => Some(PacketType::StorageRegisterResponse),
            4 => Some(PacketType::TransferFileHead),
            5 => Some(PacketType::TransferFileBody),
            6 => Some(PacketType::TransferFileEnd),
            7 => Some(PacketType::TransferResponse),
            8 => Some(PacketType::DownloadRequest),
            10 => Some(PacketType::UploadRequest),
            11 => Some(PacketType::UploadResponse),
            12 => Some(PacketType::UpdateFileMetaStorage),
            20 => Some(PacketType::Success),
            21 => Some(PacketType::Fail),
            22 => Some(PacketType::Error),
            _ => None,
        }
    }

    /// Frames that belong to a streamed file transfer rather than a plain
    /// request/response exchange.
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            PacketType::TransferFileHead
                | PacketType::TransferFileBody
                | PacketType::TransferFileEnd
        )
    }
}

/// One decoded wire frame. Ephemeral, never persisted.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub correlation_id: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, correlation_id: u32, payload: impl Into<Bytes>) -> Packet {
        Packet {
            packet_type,
            correlation_id,
            payload: payload.into(),
        }
    }

    /// A frame with an empty payload (acks, heartbeat replies).
    pub fn empty(packet_type: PacketType, correlation_id: u32) -> Packet {
        Packet::new(packet_type, correlation_id, Bytes::new())
    }

    /// An ERROR frame carrying a UTF-8 message.
    pub fn error(correlation_id: u32, message: impl Into<String>) -> Packet {
        Packet::new(
            PacketType::Error,
            correlation_id,
            Bytes::from(message.into().into_bytes()),
        )
    }

    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize header + payload into a single buffer.
    pub fn encode(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD_LEN as usize {
            return Err(Error::FrameTooLarge {
                length: self.total_len() as u32,
                max: MAX_FRAME_LEN,
            });
        }
        let mut buf = BytesMut::with_capacity(self.total_len());
        buf.put_u16(MAGIC);
        buf.put_u32(self.total_len() as u32);
        buf.put_u16(self.packet_type as u16);
        buf.put_u32(self.correlation_id);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Incremental frame decoder over an arbitrary byte stream.
///
/// Bytes are appended to the internal buffer as they arrive; `decode`
/// consumes exactly one complete frame per call and leaves any remainder
/// buffered for the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// The accumulation buffer; network reads land here directly.
    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// True if no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Try to decode one frame. `Ok(None)` means more bytes are needed.
    /// Any `Err` is fatal for the stream.
    pub fn decode(&mut self) -> Result<Option<Packet>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        if magic != MAGIC {
            return Err(Error::BadMagic {
                expected: MAGIC,
                actual: magic,
            });
        }

        let total_len = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]);
        if total_len < HEADER_LEN as u32 {
            return Err(Error::Protocol(format!(
                "frame length {} below header size",
                total_len
            )));
        }
        if total_len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge {
                length: total_len,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buf.len() < total_len as usize {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total_len as usize);
        frame.advance(2); // magic
        frame.advance(4); // total length
        let raw_type = frame.get_u16();
        let packet_type = PacketType::from_u16(raw_type)
            .ok_or_else(|| Error::Protocol(format!("unknown packet type {}", raw_type)))?;
        let correlation_id = frame.get_u32();

        Ok(Some(Packet {
            packet_type,
            correlation_id,
            payload: frame.freeze(),
        }))
    }
}
