//! TCP transport — packet frames over one connection per peer.
//!
//! Frame: `[len: u32 BE][packet]`, where the packet is the channel varint
//! followed by the content. Each connection runs a writer task fed by a
//! bounded queue, so a slow peer pushes back on `send_packet_sync`, and a
//! reader task that hands decoded packets to a blocking dispatch thread in
//! arrival order.

use std::io::ErrorKind;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use fleet_core::session::MAX_CHUNK_HEADER_LEN;
use fleet_core::wire::MAX_VARINT_LEN;
use fleet_core::Packet;
use fleet_transfer::{ChannelError, NetworkChannel};

use crate::dispatch::PacketDispatcher;

/// Room for the packet and chunk headers on top of the payload. Covers
/// [`MAX_CHUNK_HEADER_LEN`] plus the packet channel varint.
pub const FRAME_SLACK: usize = 64 * 1024;

const _: () = assert!(FRAME_SLACK >= MAX_CHUNK_HEADER_LEN + MAX_VARINT_LEN);

/// Frames queued per connection before senders block.
const OUTBOUND_QUEUE: usize = 32;

/// Decoded packets queued per connection before the reader waits.
const INBOUND_QUEUE: usize = 64;

/// Largest frame a node accepts for a given chunk size.
pub fn max_frame_len(chunk_size: u32) -> usize {
    chunk_size as usize + FRAME_SLACK
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Outbound side of one peer connection.
pub struct TcpChannel {
    id: String,
    max_frame: usize,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl TcpChannel {
    /// Refuse further sends. Frames already queued are still written.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl NetworkChannel for TcpChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_packet_sync(&self, packet: &mut Packet) -> Result<(), ChannelError> {
        let frame = packet.encode()?;
        if frame.len() > self.max_frame {
            return Err(ChannelError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame,
            });
        }
        let tx = self
            .sender()
            .ok_or_else(|| ChannelError::Closed(self.id.clone()))?;
        tx.blocking_send(frame)
            .map_err(|_| ChannelError::Closed(self.id.clone()))
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

pub struct Connection {
    pub channel: Arc<TcpChannel>,
    writer: JoinHandle<std::io::Result<()>>,
    reader: JoinHandle<()>,
}

impl Connection {
    pub fn peer(&self) -> &str {
        self.channel.id()
    }

    /// Close the channel and wait until every queued frame was written.
    pub async fn finish(self) -> Result<()> {
        self.channel.close();
        let written = self.writer.await.context("connection writer panicked")?;
        self.reader.abort();
        written.with_context(|| format!("writing to {} failed", self.channel.id()))
    }
}

pub async fn connect(
    addr: impl ToSocketAddrs + std::fmt::Display,
    max_frame: usize,
    dispatcher: Arc<PacketDispatcher>,
) -> Result<Connection> {
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    Ok(spawn_connection(stream, max_frame, dispatcher))
}

/// Start the writer and reader tasks for an established stream.
pub fn spawn_connection(
    stream: TcpStream,
    max_frame: usize,
    dispatcher: Arc<PacketDispatcher>,
) -> Connection {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer, error = %e, "failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);

    let writer = tokio::spawn(write_loop(write_half, rx));
    let reader = tokio::spawn(read_loop(read_half, peer.clone(), max_frame, dispatcher));
    tracing::debug!(peer, "connection established");

    Connection {
        channel: Arc::new(TcpChannel {
            id: peer,
            max_frame,
            tx: Mutex::new(Some(tx)),
        }),
        writer,
        reader,
    }
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) -> std::io::Result<()> {
    while let Some(frame) = rx.recv().await {
        let len = u32::try_from(frame.len())
            .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "frame too large"))?;
        write.write_u32(len).await?;
        write.write_all(&frame).await?;
    }
    write.flush().await?;
    write.shutdown().await
}

async fn read_loop(
    mut read: OwnedReadHalf,
    peer: String,
    max_frame: usize,
    dispatcher: Arc<PacketDispatcher>,
) {
    let (tx, mut rx) = mpsc::channel::<Packet>(INBOUND_QUEUE);
    // Listeners may touch the filesystem; keep them off the runtime threads.
    let dispatch = tokio::task::spawn_blocking(move || {
        while let Some(packet) = rx.blocking_recv() {
            dispatcher.dispatch(packet);
        }
    });

    match read_frames(&mut read, max_frame, &tx).await {
        Ok(()) => tracing::debug!(peer, "connection closed by peer"),
        Err(e) => tracing::warn!(peer, error = %e, "connection read failed"),
    }
    drop(tx);
    if let Err(e) = dispatch.await {
        tracing::error!(peer, error = %e, "packet dispatch panicked");
    }
}

async fn read_frames(read: &mut OwnedReadHalf, max_frame: usize, tx: &mpsc::Sender<Packet>) -> Result<()> {
    loop {
        let len = match read.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if len > max_frame {
            bail!("frame of {len} bytes exceeds limit {max_frame}");
        }

        let mut frame = vec![0u8; len];
        read.read_exact(&mut frame).await.context("truncated frame")?;

        match Packet::decode(Bytes::from(frame)) {
            Ok(packet) => {
                if tx.send(packet).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "malformed packet, dropping"),
        }
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Accept peer connections until shutdown.
pub async fn serve(
    listener: TcpListener,
    max_frame: usize,
    dispatcher: Arc<PacketDispatcher>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("transport listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tracing::info!(peer = %peer, "peer connected");
                // Inbound connections only receive; dropping the channel
                // half-closes our write side.
                drop(spawn_connection(stream, max_frame, dispatcher.clone()));
            }
        }
    }
}
