//! fleet-core — shared buffer, wire primitives, session framing and config.
//! Every other fleet crate depends on this one.

pub mod buffer;
pub mod config;
pub mod packet;
pub mod session;
pub mod wire;

pub use buffer::{BufferError, TransferBuffer, TransferBufferMut};
pub use packet::Packet;
pub use session::{ChunkPacket, ChunkSessionDescriptor};
