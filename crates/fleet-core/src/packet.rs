//! Packets — the unit a transport moves between two nodes.
//!
//! A packet is a channel id (which listener gets it) and a content buffer.
//! On the wire a transport writes `[channel varint][content]` inside its
//! own length-prefixed frame.

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::{BufferError, TransferBuffer};
use crate::wire;

/// Packet channel carrying chunked transfer frames.
pub const CHUNKED_TRANSFER_CHANNEL: u32 = 0x0c;

#[derive(Debug)]
pub struct Packet {
    pub channel: u32,
    pub content: TransferBuffer,
}

impl Packet {
    pub fn new(channel: u32, content: TransferBuffer) -> Self {
        Self { channel, content }
    }

    /// Encode channel id and the readable content, consuming the content
    /// the same way any other reader would.
    pub fn encode(&mut self) -> Result<Bytes, BufferError> {
        let body = self.content.read_remaining()?;
        let mut out = BytesMut::with_capacity(wire::varint_len(self.channel) + body.len());
        wire::put_varint(&mut out, self.channel);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Decode a packet previously produced by `encode`.
    pub fn decode(frame: Bytes) -> Result<Self, BufferError> {
        let mut content = TransferBuffer::new(frame);
        let channel = content.read_varint()?;
        Ok(Self { channel, content })
    }
}
