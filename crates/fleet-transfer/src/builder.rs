//! Fluent construction of a [`ChunkedPacketSender`].
//!
//! All validation happens in [`ChunkedPacketSenderBuilder::build`]; the
//! setters never fail.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use fleet_core::config::DEFAULT_CHUNK_SIZE;
use fleet_core::session::MAX_DESCRIPTOR_LEN;
use fleet_core::{ChunkSessionDescriptor, TransferBufferMut};

use crate::channel::NetworkChannel;
use crate::sender::ChunkedPacketSender;
use crate::splitter::{ChannelsSplitter, PacketSplitter};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("chunk size not set")]
    MissingChunkSize,

    #[error("chunk size must be positive")]
    ZeroChunkSize,

    #[error("transfer channel not set")]
    MissingTransferChannel,

    #[error("transfer channel is empty")]
    EmptyTransferChannel,

    #[error("session descriptor of {len} bytes exceeds {max}")]
    DescriptorTooLarge { len: usize, max: usize },

    #[error("no source stream")]
    MissingSource,

    #[error("failed to open {}: {source}", path.display())]
    OpenSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no destination channels and no packet splitter")]
    NoDestination,
}

enum Source {
    Reader(Box<dyn Read + Send>),
    File(PathBuf),
}

#[derive(Default)]
pub struct ChunkedPacketSenderBuilder {
    session_id: Option<Uuid>,
    chunk_size: Option<u32>,
    transfer_channel: Option<String>,
    extra_data: Bytes,
    source: Option<Source>,
    channels: Vec<Arc<dyn NetworkChannel>>,
    splitter: Option<Arc<dyn PacketSplitter>>,
}

impl ChunkedPacketSenderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_file_transfer() -> Self {
        Self::new().chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Use a fixed session id instead of a random one.
    pub fn session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn transfer_channel(mut self, transfer_channel: impl Into<String>) -> Self {
        self.transfer_channel = Some(transfer_channel.into());
        self
    }

    /// Application metadata carried in every chunk's descriptor.
    pub fn with_extra_data(mut self, extra: TransferBufferMut) -> Self {
        self.extra_data = extra.into_bytes();
        self
    }

    pub fn with_extra_bytes(mut self, extra: Bytes) -> Self {
        self.extra_data = extra;
        self
    }

    pub fn source(mut self, source: impl Read + Send + 'static) -> Self {
        self.source = Some(Source::Reader(Box::new(source)));
        self
    }

    /// Read the payload from a file, opened by `build()`.
    pub fn for_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(Source::File(path.into()));
        self
    }

    pub fn to_channels<I>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn NetworkChannel>>,
    {
        self.channels.extend(channels);
        self
    }

    pub fn to_channel(mut self, channel: Arc<dyn NetworkChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Custom transmission strategy. Takes precedence over channels.
    pub fn packet_splitter(mut self, splitter: Arc<dyn PacketSplitter>) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn build(self) -> Result<ChunkedPacketSender, BuildError> {
        let chunk_size = self.chunk_size.ok_or(BuildError::MissingChunkSize)?;
        if chunk_size == 0 {
            return Err(BuildError::ZeroChunkSize);
        }
        let transfer_channel = self.transfer_channel.ok_or(BuildError::MissingTransferChannel)?;
        if transfer_channel.is_empty() {
            return Err(BuildError::EmptyTransferChannel);
        }
        let descriptor = ChunkSessionDescriptor::new(
            self.session_id.unwrap_or_else(Uuid::new_v4),
            chunk_size,
            transfer_channel,
            self.extra_data,
        );
        if descriptor.encoded_len() > MAX_DESCRIPTOR_LEN {
            return Err(BuildError::DescriptorTooLarge {
                len: descriptor.encoded_len(),
                max: MAX_DESCRIPTOR_LEN,
            });
        }

        let splitter: Arc<dyn PacketSplitter> = match self.splitter {
            Some(splitter) => splitter,
            None if self.channels.is_empty() => return Err(BuildError::NoDestination),
            None => Arc::new(ChannelsSplitter::new(self.channels)),
        };

        let source: Box<dyn Read + Send> = match self.source.ok_or(BuildError::MissingSource)? {
            Source::Reader(reader) => reader,
            Source::File(path) => match File::open(&path) {
                Ok(file) => Box::new(BufReader::new(file)),
                Err(source) => return Err(BuildError::OpenSource { path, source }),
            },
        };

        Ok(ChunkedPacketSender::new(descriptor, source, splitter))
    }
}
