//! fleet-transfer — chunked transfer of large payloads over a packet transport.
//!
//! A [`ChunkedPacketSender`] slices a byte stream into fixed-size chunks,
//! frames each with its session descriptor and index, and hands the frame
//! to a [`PacketSplitter`], by default one that multicasts the same buffer
//! to several [`NetworkChannel`]s without copying it. On the other side a
//! [`ChunkedPacketListener`] keeps one [`ChunkHandler`] per live session and
//! retires the session when the handler reports the terminal chunk.

pub mod builder;
pub mod callback;
pub mod channel;
pub mod file_handler;
pub mod handler;
pub mod memory_handler;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod splitter;
pub mod status;

pub use builder::{BuildError, ChunkedPacketSenderBuilder};
pub use callback::{FileCallbackListener, PendingFile};
pub use channel::{ChannelError, LocalChannel, NetworkChannel, PacketListener};
pub use file_handler::{CompletedTransfer, FileChunkHandler, FileChunkHandlerFactory, TransferCallback};
pub use handler::{ChunkHandler, ChunkHandlerFactory, HandlerError};
pub use memory_handler::{MemoryChunkHandler, MemoryChunkHandlerFactory, MemorySink};
pub use receiver::{ChunkOutcome, ChunkedPacketListener, ReceiveError};
pub use registry::HandlerRegistry;
pub use sender::{ChunkedPacketSender, TransferTask};
pub use splitter::{ChannelsSplitter, PacketSplitter, SplitError};
pub use status::{TransferError, TransferStatus};

pub use fleet_core::{ChunkPacket, ChunkSessionDescriptor, Packet, TransferBuffer, TransferBufferMut};

/// Transfer channel for a single file deployed into a template or service.
pub const DEPLOY_SINGLE_FILE: &str = "deploy_single_file";
