//! Handler registry — routes new sessions to a factory by transfer channel.

use std::sync::Arc;

use dashmap::DashMap;

use fleet_core::ChunkSessionDescriptor;

use crate::handler::{ChunkHandler, ChunkHandlerFactory, HandlerError};

/// Maps transfer channel names to handler factories.
///
/// The registry is itself a factory, so it can be handed straight to a
/// `ChunkedPacketListener`. Sessions on a channel nobody registered fail
/// with `HandlerError::UnknownTransferChannel`.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: DashMap<String, Arc<dyn ChunkHandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, returning the one it replaced.
    pub fn register(
        &self,
        transfer_channel: impl Into<String>,
        factory: Arc<dyn ChunkHandlerFactory>,
    ) -> Option<Arc<dyn ChunkHandlerFactory>> {
        let transfer_channel = transfer_channel.into();
        tracing::debug!(transfer_channel, "chunk handler factory registered");
        self.factories.insert(transfer_channel, factory)
    }

    pub fn unregister(&self, transfer_channel: &str) -> Option<Arc<dyn ChunkHandlerFactory>> {
        self.factories.remove(transfer_channel).map(|(_, f)| f)
    }

    pub fn contains(&self, transfer_channel: &str) -> bool {
        self.factories.contains_key(transfer_channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.factories.iter().map(|e| e.key().clone()).collect()
    }
}

impl ChunkHandlerFactory for HandlerRegistry {
    fn create_handler(
        &self,
        descriptor: &ChunkSessionDescriptor,
    ) -> Result<Box<dyn ChunkHandler>, HandlerError> {
        // Clone out of the map so the shard lock is not held across the factory call.
        let factory = self
            .factories
            .get(descriptor.transfer_channel())
            .map(|f| f.value().clone())
            .ok_or_else(|| {
                HandlerError::UnknownTransferChannel(descriptor.transfer_channel().to_string())
            })?;
        factory.create_handler(descriptor)
    }
}
