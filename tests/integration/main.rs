//! Fleet integration test harness.
//!
//! Everything runs in-process: `LocalChannel` for transfers between nodes
//! in one process, loopback TCP for the daemon's transport.
//!
//!   cargo test --test integration
//!
//! Each test owns its nodes and temp directories.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use fleet_core::config::TransferSettings;
use fleet_transfer::{
    ChunkSessionDescriptor, ChunkedPacketListener, LocalChannel, MemoryChunkHandlerFactory,
    MemorySink, NetworkChannel,
};
use fleetd::transport;
use fleetd::Node;

mod failures;
mod local;
mod tcp;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Receiver that keeps every completed transfer in memory.
pub struct MemoryNode {
    pub listener: Arc<ChunkedPacketListener>,
    received: Arc<Mutex<Vec<(Uuid, Bytes)>>>,
}

impl MemoryNode {
    pub fn new() -> Self {
        let received: Arc<Mutex<Vec<(Uuid, Bytes)>>> = Arc::default();
        let inner = received.clone();
        let sink: MemorySink = Arc::new(move |d: ChunkSessionDescriptor, data: Bytes| {
            inner.lock().unwrap().push((d.session_id(), data))
        });
        Self {
            listener: Arc::new(ChunkedPacketListener::new(Arc::new(MemoryChunkHandlerFactory::new(sink)))),
            received,
        }
    }

    pub fn channel(&self, id: &str) -> Arc<LocalChannel> {
        Arc::new(LocalChannel::new(id, self.listener.clone()))
    }

    pub fn received(&self) -> Vec<(Uuid, Bytes)> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_for(&self, session: Uuid) -> Option<Bytes> {
        self.received()
            .into_iter()
            .find(|(id, _)| *id == session)
            .map(|(_, data)| data)
    }
}

pub fn as_channels(channels: &[Arc<LocalChannel>]) -> Vec<Arc<dyn NetworkChannel>> {
    channels
        .iter()
        .map(|c| c.clone() as Arc<dyn NetworkChannel>)
        .collect()
}

/// A `fleetd` node listening on loopback with its own storage and spool.
pub struct TcpNode {
    pub addr: String,
    pub node: Node,
    pub settings: TransferSettings,
    shutdown: broadcast::Sender<()>,
    _dirs: tempfile::TempDir,
}

impl TcpNode {
    pub async fn start(chunk_size: u32) -> Result<Self> {
        let dirs = tempfile::tempdir()?;
        let settings = TransferSettings {
            chunk_size,
            temp_dir: dirs.path().join("spool"),
            storage_path: dirs.path().join("storage"),
            ..TransferSettings::default()
        };
        let node = Node::new(&settings);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(transport::serve(
            listener,
            transport::max_frame_len(chunk_size),
            node.dispatcher.clone(),
            shutdown.subscribe(),
        ));

        Ok(Self {
            addr,
            node,
            settings,
            shutdown,
            _dirs: dirs,
        })
    }

    pub fn storage(&self) -> &Path {
        &self.settings.storage_path
    }

    /// Wait until `target` under storage has exactly `expected` as content.
    pub async fn wait_for_file(&self, target: &str, expected: &[u8]) -> Result<()> {
        let path = self.storage().join(target);
        for _ in 0..100 {
            if let Ok(content) = std::fs::read(&path) {
                if content == expected {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        bail!("{} never reached the expected content", path.display())
    }
}

impl Drop for TcpNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}
