//! In-memory reassembly for small transfers.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use fleet_core::ChunkSessionDescriptor;

use crate::handler::{ChunkHandler, ChunkHandlerFactory, ChunkSequence, HandlerError};

/// Receives the reassembled payload of a finished session.
pub type MemorySink = Arc<dyn Fn(ChunkSessionDescriptor, Bytes) + Send + Sync>;

pub struct MemoryChunkHandler {
    descriptor: ChunkSessionDescriptor,
    data: BytesMut,
    sequence: ChunkSequence,
    limit: Option<usize>,
    sink: MemorySink,
}

impl MemoryChunkHandler {
    pub fn new(descriptor: ChunkSessionDescriptor, limit: Option<usize>, sink: MemorySink) -> Self {
        Self {
            descriptor,
            data: BytesMut::new(),
            sequence: ChunkSequence::default(),
            limit,
            sink,
        }
    }
}

impl ChunkHandler for MemoryChunkHandler {
    fn handle_chunk_part(&mut self, chunk_index: u32, payload: Bytes) -> Result<bool, HandlerError> {
        self.sequence.advance(chunk_index)?;
        if let Some(limit) = self.limit {
            if self.data.len() + payload.len() > limit {
                return Err(HandlerError::Rejected(format!(
                    "transfer exceeds {limit} byte limit"
                )));
            }
        }
        self.data.extend_from_slice(&payload);

        if payload.len() < self.descriptor.chunk_size() as usize {
            self.sequence.finish();
            let data = std::mem::take(&mut self.data).freeze();
            (self.sink)(self.descriptor.clone(), data);
            return Ok(true);
        }
        Ok(false)
    }

    fn abort(&mut self) {
        self.data = BytesMut::new();
    }
}

pub struct MemoryChunkHandlerFactory {
    limit: Option<usize>,
    sink: MemorySink,
}

impl MemoryChunkHandlerFactory {
    pub fn new(sink: MemorySink) -> Self {
        Self { limit: None, sink }
    }

    /// Reject sessions whose payload grows past `limit` bytes.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl ChunkHandlerFactory for MemoryChunkHandlerFactory {
    fn create_handler(
        &self,
        descriptor: &ChunkSessionDescriptor,
    ) -> Result<Box<dyn ChunkHandler>, HandlerError> {
        Ok(Box::new(MemoryChunkHandler::new(
            descriptor.clone(),
            self.limit,
            self.sink.clone(),
        )))
    }
}
