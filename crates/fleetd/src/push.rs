//! Outgoing deployments — pushes one file to a set of peers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use fleet_core::config::TransferSettings;
use fleet_transfer::{
    ChunkedPacketSender, NetworkChannel, TransferError, TransferStatus, DEPLOY_SINGLE_FILE,
};

use crate::deploy::{validate_target, DeployTarget};
use crate::dispatch::PacketDispatcher;
use crate::transport::{self, Connection};

/// Send `file` to every peer as `target`, waiting until all chunks were
/// written or the transfer timeout expired.
pub async fn push_file(
    settings: &TransferSettings,
    file: &Path,
    target: DeployTarget,
    peers: &[String],
) -> Result<()> {
    validate_target(&target.path)?;
    if peers.is_empty() {
        bail!("no peers to push to");
    }

    let max_frame = transport::max_frame_len(settings.chunk_size);
    let replies = Arc::new(PacketDispatcher::new());
    let mut connections: Vec<Connection> = Vec::with_capacity(peers.len());
    for peer in peers {
        connections.push(transport::connect(peer.as_str(), max_frame, replies.clone()).await?);
    }
    let channels: Vec<Arc<dyn NetworkChannel>> = connections
        .iter()
        .map(|c| c.channel.clone() as Arc<dyn NetworkChannel>)
        .collect();

    let sender = ChunkedPacketSender::for_file_transfer()
        .chunk_size(settings.chunk_size)
        .transfer_channel(DEPLOY_SINGLE_FILE)
        .with_extra_data(target.encode())
        .for_file(file)
        .to_channels(channels)
        .build()
        .context("invalid transfer")?;

    let session = sender.descriptor().session_id();
    tracing::info!(
        session = %session,
        file = %file.display(),
        target = target.path,
        peers = peers.len(),
        "pushing file"
    );

    let status = sender
        .transfer()
        .wait_timeout(
            settings.transfer_timeout(),
            TransferStatus::Failure(TransferError::Aborted("timed out".to_string())),
        )
        .await;

    let mut flush_failed = false;
    for connection in connections {
        let peer = connection.peer().to_string();
        if let Err(e) = connection.finish().await {
            tracing::warn!(peer, error = %e, "connection did not flush");
            flush_failed = true;
        }
    }

    match status {
        TransferStatus::Success if !flush_failed => {
            tracing::info!(session = %session, "file pushed");
            Ok(())
        }
        TransferStatus::Success => bail!("transfer {session} was not fully written"),
        other => bail!("transfer {session} failed: {other}"),
    }
}
