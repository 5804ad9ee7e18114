//! Chunk sessions — the descriptor every chunk carries, and chunk framing.
//!
//! Wire layout of one chunk frame (content of a packet on
//! `CHUNKED_TRANSFER_CHANNEL`):
//!
//! ```text
//! [session_id: 16][chunk_size: varint][transfer_channel: varint len + utf-8]
//! [transfer_information: varint len + bytes][chunk_index: varint]
//! [payload: varint len + bytes]
//! ```
//!
//! A payload shorter than `chunk_size` ends the session. A stream that
//! ends exactly on a chunk boundary is closed by a zero-length payload.

use std::hash::{Hash, Hasher};

use bytes::Bytes;
use uuid::Uuid;

use crate::buffer::{BufferError, TransferBuffer, TransferBufferMut};
use crate::packet::{Packet, CHUNKED_TRANSFER_CHANNEL};
use crate::wire::{self, UUID_LEN};

/// Largest encoded descriptor a sender may put on the wire.
pub const MAX_DESCRIPTOR_LEN: usize = 32 * 1024;

/// Largest chunk frame overhead: descriptor, chunk index and payload length.
pub const MAX_CHUNK_HEADER_LEN: usize = MAX_DESCRIPTOR_LEN + 2 * wire::MAX_VARINT_LEN;

// ── Descriptor ────────────────────────────────────────────────────────────────

/// Identifies one logical transfer.
///
/// Equality and hashing look at `session_id` only: two descriptors with the
/// same id are the same session even if the other fields differ. Use
/// [`ChunkSessionDescriptor::same_parameters`] to detect such a mismatch.
#[derive(Debug, Clone)]
pub struct ChunkSessionDescriptor {
    session_id: Uuid,
    chunk_size: u32,
    transfer_channel: String,
    transfer_information: Bytes,
}

impl ChunkSessionDescriptor {
    pub fn new(
        session_id: Uuid,
        chunk_size: u32,
        transfer_channel: impl Into<String>,
        transfer_information: Bytes,
    ) -> Self {
        Self {
            session_id,
            chunk_size,
            transfer_channel: transfer_channel.into(),
            transfer_information,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn transfer_channel(&self) -> &str {
        &self.transfer_channel
    }

    /// Opaque metadata for the receiving application.
    pub fn transfer_information(&self) -> &Bytes {
        &self.transfer_information
    }

    /// Fresh reader over the transfer information.
    pub fn information_buffer(&self) -> TransferBuffer {
        TransferBuffer::new(self.transfer_information.clone())
    }

    /// True if every field, not just the id, matches.
    pub fn same_parameters(&self, other: &Self) -> bool {
        self.session_id == other.session_id
            && self.chunk_size == other.chunk_size
            && self.transfer_channel == other.transfer_channel
            && self.transfer_information == other.transfer_information
    }

    /// Encoded size of this descriptor.
    pub fn encoded_len(&self) -> usize {
        UUID_LEN
            + wire::varint_len(self.chunk_size)
            + wire::varint_len(self.transfer_channel.len() as u32)
            + self.transfer_channel.len()
            + wire::varint_len(self.transfer_information.len() as u32)
            + self.transfer_information.len()
    }

    pub fn write_to(&self, out: &mut TransferBufferMut) {
        out.write_uuid(self.session_id)
            .write_varint(self.chunk_size)
            .write_string(&self.transfer_channel)
            .write_bytes(&self.transfer_information);
    }

    pub fn read_from(buf: &mut TransferBuffer) -> Result<Self, DecodeError> {
        let session_id = buf.read_uuid()?;
        let chunk_size = buf.read_varint()?;
        if chunk_size == 0 {
            return Err(DecodeError::ZeroChunkSize);
        }
        let transfer_channel = buf.read_string()?;
        if transfer_channel.is_empty() {
            return Err(DecodeError::EmptyTransferChannel);
        }
        let transfer_information = buf.read_bytes()?;
        Ok(Self {
            session_id,
            chunk_size,
            transfer_channel,
            transfer_information,
        })
    }
}

impl PartialEq for ChunkSessionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }
}

impl Eq for ChunkSessionDescriptor {}

impl Hash for ChunkSessionDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.session_id.hash(state);
    }
}

// ── Chunk frames ──────────────────────────────────────────────────────────────

/// One decoded chunk of a session.
#[derive(Debug, Clone)]
pub struct ChunkPacket {
    pub descriptor: ChunkSessionDescriptor,
    pub chunk_index: u32,
    pub payload: Bytes,
}

impl ChunkPacket {
    /// Frame a payload slice as a packet ready for transmission.
    pub fn frame(descriptor: &ChunkSessionDescriptor, chunk_index: u32, payload: &[u8]) -> Packet {
        let capacity = descriptor.encoded_len()
            + wire::varint_len(chunk_index)
            + wire::MAX_VARINT_LEN
            + payload.len();
        let mut out = TransferBufferMut::with_capacity(capacity);
        descriptor.write_to(&mut out);
        out.write_varint(chunk_index).write_bytes(payload);
        Packet::new(CHUNKED_TRANSFER_CHANNEL, out.freeze())
    }

    /// Decode a chunk frame from a packet's content.
    pub fn decode(content: &mut TransferBuffer) -> Result<Self, DecodeError> {
        let descriptor = ChunkSessionDescriptor::read_from(content)?;
        let chunk_index = content.read_varint()?;
        let payload = content.read_bytes()?;
        if payload.len() > descriptor.chunk_size as usize {
            return Err(DecodeError::PayloadTooLarge {
                len: payload.len(),
                chunk_size: descriptor.chunk_size,
            });
        }
        Ok(Self {
            descriptor,
            chunk_index,
            payload,
        })
    }

    /// A short (or empty) payload closes the session.
    pub fn is_terminal(&self) -> bool {
        self.payload.len() < self.descriptor.chunk_size as usize
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Malformed chunk frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("chunk size must be positive")]
    ZeroChunkSize,

    #[error("transfer channel is empty")]
    EmptyTransferChannel,

    #[error("payload of {len} bytes exceeds chunk size {chunk_size}")]
    PayloadTooLarge { len: usize, chunk_size: u32 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn descriptor(chunk_size: u32) -> ChunkSessionDescriptor {
        ChunkSessionDescriptor::new(
            Uuid::new_v4(),
            chunk_size,
            "deploy_single_file",
            Bytes::from_static(b"\x05hello"),
        )
    }

    #[test]
    fn identity_is_session_id_only() {
        let a = descriptor(1024);
        let b = ChunkSessionDescriptor::new(a.session_id(), 64, "other", Bytes::new());
        assert_eq!(a, b);
        assert!(!a.same_parameters(&b));

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
        assert!(!set.insert(b));
    }

    #[test]
    fn frame_decodes_to_same_chunk() {
        let desc = descriptor(8);
        let mut packet = ChunkPacket::frame(&desc, 3, b"abcde");
        assert_eq!(packet.channel, CHUNKED_TRANSFER_CHANNEL);

        let chunk = ChunkPacket::decode(&mut packet.content).unwrap();
        assert!(chunk.descriptor.same_parameters(&desc));
        assert_eq!(chunk.chunk_index, 3);
        assert_eq!(&chunk.payload[..], b"abcde");
        assert!(chunk.is_terminal());
    }

    #[test]
    fn full_chunk_is_not_terminal_empty_chunk_is() {
        let desc = descriptor(4);
        let mut full = ChunkPacket::frame(&desc, 0, b"abcd");
        assert!(!ChunkPacket::decode(&mut full.content).unwrap().is_terminal());

        let mut empty = ChunkPacket::frame(&desc, 1, b"");
        let chunk = ChunkPacket::decode(&mut empty.content).unwrap();
        assert!(chunk.payload.is_empty());
        assert!(chunk.is_terminal());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let desc = descriptor(2);
        let mut packet = ChunkPacket::frame(&desc, 0, b"abc");
        assert_eq!(
            ChunkPacket::decode(&mut packet.content).unwrap_err(),
            DecodeError::PayloadTooLarge {
                len: 3,
                chunk_size: 2
            }
        );
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let desc = ChunkSessionDescriptor::new(Uuid::new_v4(), 0, "x", Bytes::new());
        let mut packet = ChunkPacket::frame(&desc, 0, b"");
        assert_eq!(
            ChunkPacket::decode(&mut packet.content).unwrap_err(),
            DecodeError::ZeroChunkSize
        );
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let desc = descriptor(16);
        let mut packet = ChunkPacket::frame(&desc, 0, b"abc");
        let mut bytes = packet.content.read_remaining().unwrap().to_vec();
        bytes.truncate(bytes.len() - 2);
        let mut content = TransferBuffer::from(bytes);
        assert!(matches!(
            ChunkPacket::decode(&mut content),
            Err(DecodeError::Buffer(BufferError::Underflow { .. }))
        ));
    }

    #[test]
    fn encoded_len_matches_written_bytes() {
        let desc = descriptor(1 << 20);
        let mut out = TransferBufferMut::new();
        desc.write_to(&mut out);
        assert_eq!(out.len(), desc.encoded_len());
    }
}
