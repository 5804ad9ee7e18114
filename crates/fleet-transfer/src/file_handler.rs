//! File reassembly — spools a session's chunks into a temp file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tempfile::{NamedTempFile, TempPath};

use fleet_core::ChunkSessionDescriptor;

use crate::handler::{ChunkHandler, ChunkHandlerFactory, ChunkSequence, HandlerError};

/// A fully received file, still in its temp location.
///
/// The temp file is deleted when this value is dropped unless it was
/// persisted first.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub descriptor: ChunkSessionDescriptor,
    pub path: TempPath,
    pub size: u64,
    /// BLAKE3 hash of the received bytes.
    pub digest: [u8; 32],
}

impl CompletedTransfer {
    /// Move the file to `dest`, keeping it past this value's lifetime.
    pub fn persist(self, dest: &Path) -> std::io::Result<PathBuf> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match self.path.persist(dest) {
            Ok(()) => Ok(dest.to_path_buf()),
            // rename() cannot cross filesystems; fall back to a copy.
            Err(e) => {
                std::fs::copy(&e.path, dest)?;
                Ok(dest.to_path_buf())
            }
        }
    }

    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

/// Receives completed transfers.
pub trait TransferCallback: Send + Sync {
    fn on_complete(&self, transfer: CompletedTransfer);
}

impl<F> TransferCallback for F
where
    F: Fn(CompletedTransfer) + Send + Sync,
{
    fn on_complete(&self, transfer: CompletedTransfer) {
        self(transfer)
    }
}

pub struct FileChunkHandler {
    descriptor: ChunkSessionDescriptor,
    writer: Option<BufWriter<File>>,
    path: Option<TempPath>,
    hasher: blake3::Hasher,
    sequence: ChunkSequence,
    written: u64,
    callback: Arc<dyn TransferCallback>,
}

impl FileChunkHandler {
    /// Open a temp file for `descriptor` inside `dir`.
    pub fn new(
        descriptor: ChunkSessionDescriptor,
        dir: &Path,
        callback: Arc<dyn TransferCallback>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (file, path) = NamedTempFile::new_in(dir)?.into_parts();
        tracing::debug!(
            session = %descriptor.session_id(),
            path = %path.display(),
            "spooling transfer to temp file"
        );
        Ok(Self {
            descriptor,
            writer: Some(BufWriter::new(file)),
            path: Some(path),
            hasher: blake3::Hasher::new(),
            sequence: ChunkSequence::default(),
            written: 0,
            callback,
        })
    }

    fn finish(&mut self) -> Result<(), HandlerError> {
        if let Some(writer) = self.writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        let Some(path) = self.path.take() else {
            return Err(HandlerError::Completed);
        };
        let transfer = CompletedTransfer {
            descriptor: self.descriptor.clone(),
            path,
            size: self.written,
            digest: *self.hasher.finalize().as_bytes(),
        };
        tracing::info!(
            session = %self.descriptor.session_id(),
            transfer_channel = self.descriptor.transfer_channel(),
            bytes = transfer.size,
            chunks = self.sequence.accepted(),
            digest = transfer.digest_hex(),
            "file transfer received"
        );
        self.callback.on_complete(transfer);
        Ok(())
    }
}

impl ChunkHandler for FileChunkHandler {
    fn handle_chunk_part(&mut self, chunk_index: u32, payload: Bytes) -> Result<bool, HandlerError> {
        self.sequence.advance(chunk_index)?;
        let writer = self.writer.as_mut().ok_or(HandlerError::Completed)?;
        writer.write_all(&payload)?;
        self.hasher.update(&payload);
        self.written += payload.len() as u64;

        if payload.len() < self.descriptor.chunk_size() as usize {
            self.sequence.finish();
            self.finish()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn abort(&mut self) {
        self.writer = None;
        // Dropping the TempPath deletes the file.
        if let Some(path) = self.path.take() {
            tracing::debug!(
                session = %self.descriptor.session_id(),
                path = %path.display(),
                "discarding partial transfer"
            );
        }
    }
}

/// Creates a [`FileChunkHandler`] per session, all spooling into one directory.
pub struct FileChunkHandlerFactory {
    dir: PathBuf,
    callback: Arc<dyn TransferCallback>,
}

impl FileChunkHandlerFactory {
    pub fn new(dir: impl Into<PathBuf>, callback: Arc<dyn TransferCallback>) -> Self {
        Self {
            dir: dir.into(),
            callback,
        }
    }
}

impl ChunkHandlerFactory for FileChunkHandlerFactory {
    fn create_handler(
        &self,
        descriptor: &ChunkSessionDescriptor,
    ) -> Result<Box<dyn ChunkHandler>, HandlerError> {
        let handler = FileChunkHandler::new(descriptor.clone(), &self.dir, self.callback.clone())?;
        Ok(Box::new(handler))
    }
}
