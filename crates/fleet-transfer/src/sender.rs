//! Chunked sender — slices a byte stream into framed chunks.

use std::future::Future;
use std::io::{ErrorKind, Read};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use fleet_core::{ChunkPacket, ChunkSessionDescriptor};

use crate::builder::ChunkedPacketSenderBuilder;
use crate::splitter::PacketSplitter;
use crate::status::{TransferError, TransferStatus};

/// A ready-to-run transfer of one source to its destinations.
///
/// Chunk `i` carries source bytes `[i * chunk_size, (i + 1) * chunk_size)`.
/// The first chunk shorter than `chunk_size` ends the session; a source
/// whose length is an exact multiple of the chunk size is followed by an
/// empty chunk.
pub struct ChunkedPacketSender {
    descriptor: ChunkSessionDescriptor,
    source: Box<dyn Read + Send>,
    splitter: Arc<dyn PacketSplitter>,
}

impl ChunkedPacketSender {
    /// Builder with no defaults.
    pub fn builder() -> ChunkedPacketSenderBuilder {
        ChunkedPacketSenderBuilder::new()
    }

    /// Builder preset with the default chunk size for file transfers.
    pub fn for_file_transfer() -> ChunkedPacketSenderBuilder {
        ChunkedPacketSenderBuilder::for_file_transfer()
    }

    pub fn new(
        descriptor: ChunkSessionDescriptor,
        source: Box<dyn Read + Send>,
        splitter: Arc<dyn PacketSplitter>,
    ) -> Self {
        Self {
            descriptor,
            source,
            splitter,
        }
    }

    pub fn descriptor(&self) -> &ChunkSessionDescriptor {
        &self.descriptor
    }

    /// Start the transfer on the blocking pool.
    ///
    /// # Panics
    /// When called outside a tokio runtime.
    pub fn transfer(self) -> TransferTask {
        let session_id = self.descriptor.session_id();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        tracing::info!(
            session = %session_id,
            transfer_channel = self.descriptor.transfer_channel(),
            chunk_size = self.descriptor.chunk_size(),
            "chunked transfer started"
        );
        let handle = tokio::task::spawn_blocking(move || self.run(&flag));
        TransferTask {
            session_id,
            cancelled,
            handle,
        }
    }

    /// Run the whole transfer on the current thread.
    pub fn transfer_blocking(self) -> TransferStatus {
        self.run(&AtomicBool::new(false))
    }

    fn run(mut self, cancelled: &AtomicBool) -> TransferStatus {
        let session = self.descriptor.session_id();
        let chunk_size = self.descriptor.chunk_size() as usize;
        let mut chunk = vec![0u8; chunk_size];
        let mut chunk_index: u32 = 0;
        let mut sent: u64 = 0;

        loop {
            if cancelled.load(Ordering::Acquire) {
                tracing::info!(session = %session, chunk_index, "chunked transfer cancelled");
                return TransferStatus::Cancelled;
            }

            let len = match read_full(&mut self.source, &mut chunk) {
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!(session = %session, chunk_index, error = %e, "source read failed");
                    return TransferStatus::Failure(TransferError::SourceRead(e));
                }
            };

            let packet = ChunkPacket::frame(&self.descriptor, chunk_index, &chunk[..len]);
            if let Err(source) = self.splitter.split(packet) {
                tracing::warn!(session = %session, chunk_index, error = %source, "chunk split failed");
                return TransferStatus::Failure(TransferError::Split {
                    chunk_index,
                    source,
                });
            }
            tracing::trace!(session = %session, chunk_index, len, "chunk sent");
            sent += len as u64;

            if len < chunk_size {
                tracing::info!(
                    session = %session,
                    chunks = u64::from(chunk_index) + 1,
                    bytes = sent,
                    "chunked transfer complete"
                );
                return TransferStatus::Success;
            }

            chunk_index = match chunk_index.checked_add(1) {
                Some(next) => next,
                None => return TransferStatus::Failure(TransferError::TooManyChunks),
            };
        }
    }
}

/// Fill `buf` from `source`, stopping early only at end of stream.
fn read_full(source: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Running transfer ──────────────────────────────────────────────────────────

/// Handle to a running transfer. Resolves to its final [`TransferStatus`].
///
/// Dropping the handle does not stop the transfer; call [`cancel`] for that.
///
/// [`cancel`]: TransferTask::cancel
pub struct TransferTask {
    session_id: Uuid,
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<TransferStatus>,
}

impl TransferTask {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Stop before the next chunk. A chunk already being split completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> TransferStatus {
        self.await
    }

    /// Wait at most `timeout`; on expiry cancel the transfer and return `fallback`.
    pub async fn wait_timeout(mut self, timeout: Duration, fallback: TransferStatus) -> TransferStatus {
        match tokio::time::timeout(timeout, &mut self).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(session = %self.session_id, ?timeout, "chunked transfer timed out");
                self.cancel();
                fallback
            }
        }
    }
}

impl Future for TransferTask {
    type Output = TransferStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let status = match ready!(Pin::new(&mut self.handle).poll(cx)) {
            Ok(status) => status,
            Err(e) => TransferStatus::Failure(TransferError::Aborted(e.to_string())),
        };
        Poll::Ready(status)
    }
}
