//! Chunk handler contract — per-session reassembly strategies.
//!
//! One handler instance exists per live session. It is created by a
//! [`ChunkHandlerFactory`] on the first chunk and is never shared between
//! sessions. Chunks reach it in send order: the transport only guarantees
//! ordering within one channel, so a session must travel over a single
//! channel per receiver.

use bytes::Bytes;

use fleet_core::buffer::BufferError;
use fleet_core::ChunkSessionDescriptor;

pub trait ChunkHandler: Send {
    /// Consume the next chunk. Returns true when it was the terminal one.
    fn handle_chunk_part(&mut self, chunk_index: u32, payload: Bytes) -> Result<bool, HandlerError>;

    /// The session failed or was abandoned; discard any resources.
    fn abort(&mut self) {}
}

/// Builds the handler for a newly seen session.
pub trait ChunkHandlerFactory: Send + Sync {
    fn create_handler(
        &self,
        descriptor: &ChunkSessionDescriptor,
    ) -> Result<Box<dyn ChunkHandler>, HandlerError>;
}

impl<F> ChunkHandlerFactory for F
where
    F: Fn(&ChunkSessionDescriptor) -> Result<Box<dyn ChunkHandler>, HandlerError> + Send + Sync,
{
    fn create_handler(
        &self,
        descriptor: &ChunkSessionDescriptor,
    ) -> Result<Box<dyn ChunkHandler>, HandlerError> {
        self(descriptor)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("no handler registered for transfer channel {0:?}")]
    UnknownTransferChannel(String),

    #[error("chunk {got} arrived, expected chunk {expected}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("session already completed")]
    Completed,

    #[error("invalid transfer information: {0}")]
    InvalidInformation(#[from] BufferError),

    #[error("transfer rejected: {0}")]
    Rejected(String),

    #[error("handler panicked")]
    Panicked,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tracks the next expected chunk index of a session.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkSequence {
    next: u32,
    finished: bool,
}

impl ChunkSequence {
    /// Accept `chunk_index` if it is the next one in order.
    pub fn advance(&mut self, chunk_index: u32) -> Result<(), HandlerError> {
        if self.finished {
            return Err(HandlerError::Completed);
        }
        if chunk_index != self.next {
            return Err(HandlerError::OutOfOrder {
                expected: self.next,
                got: chunk_index,
            });
        }
        self.next = self.next.wrapping_add(1);
        Ok(())
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Chunks accepted so far.
    pub fn accepted(&self) -> u32 {
        self.next
    }
}
