//! Routes incoming packets to listeners by packet channel id.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use fleet_core::Packet;
use fleet_transfer::PacketListener;

/// Maps packet channel ids to listeners and dispatches incoming packets.
#[derive(Default)]
pub struct PacketDispatcher {
    listeners: HashMap<u32, Vec<Arc<dyn PacketListener>>>,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener for `channel`. Several listeners may share a channel;
    /// each receives its own view of the packet.
    pub fn register(&mut self, channel: u32, listener: Arc<dyn PacketListener>) {
        self.listeners.entry(channel).or_default().push(listener);
    }

    pub fn handles(&self, channel: u32) -> bool {
        self.listeners.contains_key(&channel)
    }

    /// Dispatch an incoming packet.
    /// Returns false if no listener handles its channel.
    pub fn dispatch(&self, packet: Packet) -> bool {
        let Some(listeners) = self.listeners.get(&packet.channel) else {
            tracing::debug!(channel = packet.channel, "no listener for packet channel, dropping");
            return false;
        };

        let Some((last, rest)) = listeners.split_last() else {
            return false;
        };
        for listener in rest {
            match packet.content.duplicate() {
                Ok(content) => deliver(listener.as_ref(), Packet::new(packet.channel, content)),
                Err(e) => {
                    tracing::warn!(channel = packet.channel, error = %e, "packet content unreadable");
                    return true;
                }
            }
        }
        deliver(last.as_ref(), packet);
        true
    }
}

/// A panicking listener must not take the connection's dispatch thread down.
fn deliver(listener: &dyn PacketListener, packet: Packet) {
    let channel = packet.channel;
    if catch_unwind(AssertUnwindSafe(|| listener.handle(packet))).is_err() {
        tracing::error!(channel, "packet listener panicked");
    }
}
