//! fleetd — fleet node daemon.
//!
//! Carries chunked transfers over TCP: accepts peer connections, routes
//! packets to listeners, lands `deploy_single_file` transfers in the
//! storage root and pushes files to other nodes.

pub mod deploy;
pub mod dispatch;
pub mod push;
pub mod sweeper;
pub mod transport;

use std::sync::Arc;

use fleet_core::config::TransferSettings;
use fleet_core::packet::CHUNKED_TRANSFER_CHANNEL;
use fleet_transfer::{ChunkedPacketListener, FileChunkHandlerFactory, HandlerRegistry, DEPLOY_SINGLE_FILE};

use deploy::FileDeployer;
use dispatch::PacketDispatcher;

/// Receiving side of a node: the chunk listener and the dispatcher it is
/// registered with.
pub struct Node {
    pub receiver: Arc<ChunkedPacketListener>,
    pub dispatcher: Arc<PacketDispatcher>,
    pub handlers: Arc<HandlerRegistry>,
}

impl Node {
    /// Wire up file deployments per `settings`.
    pub fn new(settings: &TransferSettings) -> Self {
        let handlers = Arc::new(HandlerRegistry::new());
        let deployer = Arc::new(FileDeployer::new(&settings.storage_path));
        handlers.register(
            DEPLOY_SINGLE_FILE,
            Arc::new(FileChunkHandlerFactory::new(&settings.temp_dir, deployer)),
        );

        let receiver = Arc::new(
            ChunkedPacketListener::new(handlers.clone())
                .with_retired_ttl(settings.retired_session_ttl()),
        );
        let mut dispatcher = PacketDispatcher::new();
        dispatcher.register(CHUNKED_TRANSFER_CHANNEL, receiver.clone());

        Self {
            receiver,
            dispatcher: Arc::new(dispatcher),
            handlers,
        }
    }
}
