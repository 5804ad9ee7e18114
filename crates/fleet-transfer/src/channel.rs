//! Network channel contract — what the transfer layer needs from a transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fleet_core::buffer::BufferError;
use fleet_core::Packet;

/// One destination a packet can be sent to.
///
/// Packets sent on one channel arrive in the order they were sent. There
/// is no ordering between different channels.
pub trait NetworkChannel: Send + Sync {
    /// Human-readable name for logs (usually the peer address).
    fn id(&self) -> &str;

    /// Transmit `packet`, reading its content from the current cursor.
    ///
    /// Blocks while the outbound queue is full. Implementations backed by
    /// an async runtime must not be called from inside an async task.
    fn send_packet_sync(&self, packet: &mut Packet) -> Result<(), ChannelError>;
}

/// Inbound packet handler registered against a packet channel id.
///
/// Called on the transport's dispatch path, so it must not panic or block
/// for long; failures are logged and swallowed.
pub trait PacketListener: Send + Sync {
    fn handle(&self, packet: Packet);
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(String),

    #[error("frame of {len} bytes exceeds channel limit {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("failed to encode packet: {0}")]
    Encode(#[from] BufferError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── In-process channel ────────────────────────────────────────────────────────

/// Channel that hands every packet straight to a listener in this process.
///
/// Packets still go through the real encode/decode path, so the listener
/// sees exactly what a remote peer would.
pub struct LocalChannel {
    id: String,
    listener: Arc<dyn PacketListener>,
    open: AtomicBool,
    sent: AtomicU64,
}

impl LocalChannel {
    pub fn new(id: impl Into<String>, listener: Arc<dyn PacketListener>) -> Self {
        Self {
            id: id.into(),
            listener,
            open: AtomicBool::new(true),
            sent: AtomicU64::new(0),
        }
    }

    /// Reject every further send.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Packets delivered so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }
}

impl NetworkChannel for LocalChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_packet_sync(&self, packet: &mut Packet) -> Result<(), ChannelError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(ChannelError::Closed(self.id.clone()));
        }
        let frame = packet.encode()?;
        let delivered = Packet::decode(frame)?;
        self.sent.fetch_add(1, Ordering::AcqRel);
        self.listener.handle(delivered);
        Ok(())
    }
}
