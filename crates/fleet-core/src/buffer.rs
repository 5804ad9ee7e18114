//! Transfer buffers — a shared byte region with a replayable read cursor.
//!
//! A `TransferBuffer` is a view over an immutable, reference-counted
//! `Bytes` region plus a read cursor. Reads advance the cursor. Once the
//! last byte has been read the buffer releases its region automatically,
//! unless releasing was disabled — which is what a caller does before it
//! lets several consumers traverse the same buffer.
//!
//! `start_transaction` snapshots the cursor and `redo_transaction`
//! restores it, so one consumer can read everything and the next one can
//! start again from the same offset. The cursor is not a concurrency
//! primitive: a buffer is owned by one task at a time.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::wire::{self, WireError, UUID_LEN};

/// Errors raised when reading from a transfer buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("buffer underflow: needed {needed} bytes, {remaining} readable")]
    Underflow { needed: usize, remaining: usize },

    #[error("buffer was already released")]
    Released,

    #[error(transparent)]
    Wire(#[from] WireError),
}

// ── Read side ─────────────────────────────────────────────────────────────────

/// Readable, reference-counted view over a byte region.
#[derive(Debug)]
pub struct TransferBuffer {
    /// `None` once released.
    data: Option<Bytes>,
    position: usize,
    transaction: Option<usize>,
    acquires: usize,
    releasing: bool,
}

impl TransferBuffer {
    pub fn new(data: Bytes) -> Self {
        Self {
            data: Some(data),
            position: 0,
            transaction: None,
            acquires: 1,
            releasing: true,
        }
    }

    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }

    /// Bytes left between the cursor and the end of the region.
    pub fn readable_bytes(&self) -> usize {
        self.data
            .as_ref()
            .map(|d| d.len().saturating_sub(self.position))
            .unwrap_or(0)
    }

    /// True until the region has been released.
    pub fn accessible(&self) -> bool {
        self.data.is_some()
    }

    /// Outstanding acquires. Zero means released.
    pub fn acquires(&self) -> usize {
        self.acquires
    }

    /// True while `release` and end-of-read release are honoured.
    pub fn releasing_enabled(&self) -> bool {
        self.releasing
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Add one acquire; the region survives one more `release`.
    pub fn acquire(&mut self) -> &mut Self {
        if self.accessible() {
            self.acquires += 1;
        }
        self
    }

    /// Exempt the buffer from every release until `enable_releasing`.
    pub fn disable_releasing(&mut self) -> &mut Self {
        self.releasing = false;
        self
    }

    pub fn enable_releasing(&mut self) -> &mut Self {
        self.releasing = true;
        self
    }

    /// Drop one acquire, freeing the region when none are left.
    ///
    /// Discarded while releasing is disabled. Returns true if this call
    /// freed the region.
    pub fn release(&mut self) -> bool {
        if !self.releasing || !self.accessible() {
            return false;
        }
        self.acquires = self.acquires.saturating_sub(1);
        if self.acquires == 0 {
            self.data = None;
            return true;
        }
        false
    }

    /// Free the region regardless of acquires or the releasing flag.
    pub fn force_release(&mut self) {
        self.acquires = 0;
        self.data = None;
    }

    // ── Transactions ──────────────────────────────────────────────────────────

    /// Remember the current cursor. Overrides an earlier snapshot.
    pub fn start_transaction(&mut self) -> &mut Self {
        self.transaction = Some(self.position);
        self
    }

    /// Move the cursor back to the last snapshot, or to 0 without one.
    pub fn redo_transaction(&mut self) -> &mut Self {
        self.position = self.transaction.unwrap_or(0);
        self
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, BufferError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, BufferError> {
        Ok(self.take(2)?.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        Ok(self.take(4)?.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64, BufferError> {
        Ok(self.take(8)?.get_u64())
    }

    pub fn read_varint(&mut self) -> Result<u32, BufferError> {
        let data = self.region()?;
        let mut window = &data[self.position..];
        let before = window.len();
        let value = wire::get_varint(&mut window)?;
        let consumed = before - window.len();
        self.advance(consumed);
        Ok(value)
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, BufferError> {
        let raw = self.take(UUID_LEN)?;
        let mut id = [0u8; UUID_LEN];
        id.copy_from_slice(&raw);
        Ok(Uuid::from_bytes(id))
    }

    pub fn read_string(&mut self) -> Result<String, BufferError> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8.into())
    }

    /// Length-prefixed byte block. Shares the region, no copy.
    pub fn read_bytes(&mut self) -> Result<Bytes, BufferError> {
        let len = self.read_varint()? as usize;
        self.take(len)
    }

    /// Length-prefixed nested buffer.
    pub fn read_buffer(&mut self) -> Result<TransferBuffer, BufferError> {
        Ok(TransferBuffer::new(self.read_bytes()?))
    }

    /// Everything between the cursor and the end of the region.
    pub fn read_remaining(&mut self) -> Result<Bytes, BufferError> {
        let len = self.readable_bytes();
        self.take(len)
    }

    /// Independent buffer over the readable bytes. Shares the region and
    /// leaves this cursor untouched.
    pub fn duplicate(&self) -> Result<TransferBuffer, BufferError> {
        if self.readable_bytes() == 0 {
            return Ok(TransferBuffer::empty());
        }
        let data = self.region()?;
        Ok(TransferBuffer::new(data.slice(self.position..)))
    }

    fn region(&self) -> Result<&Bytes, BufferError> {
        self.data.as_ref().ok_or(BufferError::Released)
    }

    fn take(&mut self, len: usize) -> Result<Bytes, BufferError> {
        // An exhausted buffer may already be released; reading nothing is still fine.
        if len == 0 {
            return Ok(Bytes::new());
        }
        let data = self.region()?;
        let remaining = data.len().saturating_sub(self.position);
        if len > remaining {
            return Err(BufferError::Underflow {
                needed: len,
                remaining,
            });
        }
        let out = data.slice(self.position..self.position + len);
        self.advance(len);
        Ok(out)
    }

    fn advance(&mut self, len: usize) {
        self.position += len;
        if self.releasing && self.readable_bytes() == 0 {
            self.data = None;
            self.acquires = 0;
        }
    }
}

impl From<Bytes> for TransferBuffer {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for TransferBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::new(Bytes::from(data))
    }
}

// ── Write side ────────────────────────────────────────────────────────────────

/// Growable writer producing a `TransferBuffer`.
#[derive(Debug, Default)]
pub struct TransferBufferMut {
    inner: BytesMut,
}

impl TransferBufferMut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.inner.put_u8(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(u8::from(value))
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.inner.put_u16(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.inner.put_u32(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.inner.put_u64(value);
        self
    }

    pub fn write_varint(&mut self, value: u32) -> &mut Self {
        wire::put_varint(&mut self.inner, value);
        self
    }

    pub fn write_uuid(&mut self, id: Uuid) -> &mut Self {
        self.inner.put_slice(id.as_bytes());
        self
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_bytes(value.as_bytes())
    }

    /// Length-prefixed byte block.
    ///
    /// # Panics
    /// If `value` is longer than `u32::MAX` bytes.
    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        let len = u32::try_from(value.len()).expect("byte block exceeds u32::MAX");
        self.write_varint(len);
        self.inner.put_slice(value);
        self
    }

    /// Raw bytes without a length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> &mut Self {
        self.inner.put_slice(value);
        self
    }

    /// Length-prefixed copy of the readable part of `other`.
    /// `other`'s cursor is left untouched.
    pub fn write_buffer(&mut self, other: &TransferBuffer) -> &mut Self {
        match other.data.as_ref() {
            Some(data) => self.write_bytes(&data[other.position.min(data.len())..]),
            None => self.write_bytes(&[]),
        }
    }

    pub fn freeze(self) -> TransferBuffer {
        TransferBuffer::new(self.inner.freeze())
    }

    pub fn into_bytes(self) -> Bytes {
        self.inner.freeze()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
