//! Packet splitters — how one framed chunk reaches its destinations.
//!
//! The default splitter multicasts a single packet to every channel. The
//! packet's buffer is read once per channel: releasing is disabled for the
//! duration, each send runs inside a buffer transaction so the next
//! channel starts from the same offset, and the buffer is released once
//! after the last channel. No per-destination copy of the chunk is made.

use std::sync::Arc;

use fleet_core::Packet;

use crate::channel::{ChannelError, NetworkChannel};

/// Transmission strategy invoked once per chunk.
pub trait PacketSplitter: Send + Sync {
    fn split(&self, packet: Packet) -> Result<(), SplitError>;
}

impl<F> PacketSplitter for F
where
    F: Fn(Packet) -> Result<(), SplitError> + Send + Sync,
{
    fn split(&self, packet: Packet) -> Result<(), SplitError> {
        self(packet)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// At least one channel failed. Every channel was still attempted.
    #[error("send to {channel} failed ({failed} of {attempted} destinations failed)")]
    Channel {
        channel: String,
        failed: usize,
        attempted: usize,
        #[source]
        source: ChannelError,
    },

    #[error("no destination channels")]
    NoChannels,

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Multicasts every packet to a fixed set of channels.
#[derive(Clone)]
pub struct ChannelsSplitter {
    channels: Vec<Arc<dyn NetworkChannel>>,
}

impl ChannelsSplitter {
    pub fn new(channels: Vec<Arc<dyn NetworkChannel>>) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> &[Arc<dyn NetworkChannel>] {
        &self.channels
    }
}

impl PacketSplitter for ChannelsSplitter {
    fn split(&self, mut packet: Packet) -> Result<(), SplitError> {
        fan_out(&self.channels, &mut packet)
    }
}

/// Send `packet` to every channel in order, reading its buffer once each.
///
/// A failing channel does not stop the remaining ones; the first failure
/// is returned after all channels were attempted. The buffer is released
/// exactly once, after the last channel.
pub fn fan_out(channels: &[Arc<dyn NetworkChannel>], packet: &mut Packet) -> Result<(), SplitError> {
    if channels.is_empty() {
        packet.content.release();
        return Err(SplitError::NoChannels);
    }

    packet.content.disable_releasing();

    let mut first_failure: Option<(String, ChannelError)> = None;
    let mut failed = 0;
    for channel in channels {
        packet.content.start_transaction();
        if let Err(e) = channel.send_packet_sync(packet) {
            tracing::warn!(channel = channel.id(), error = %e, "chunk send failed");
            failed += 1;
            if first_failure.is_none() {
                first_failure = Some((channel.id().to_string(), e));
            }
        }
        packet.content.redo_transaction();
    }

    packet.content.enable_releasing();
    packet.content.release();

    match first_failure {
        None => Ok(()),
        Some((channel, source)) => Err(SplitError::Channel {
            channel,
            failed,
            attempted: channels.len(),
            source,
        }),
    }
}
