//! In-process transfers over `LocalChannel`.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use fleet_transfer::{
    ChunkedPacketListener, ChunkedPacketSender, FileCallbackListener, FileChunkHandlerFactory,
    HandlerRegistry, TransferStatus,
};
use uuid::Uuid;

use crate::{as_channels, payload, MemoryNode};

#[test]
fn round_trip_across_chunk_boundaries() {
    let node = MemoryNode::new();
    let channel = node.channel("node-b");

    for (seed, len) in [0usize, 1, 1023, 1024, 1025, 2048, 2600, 5 * 1024 + 7]
        .into_iter()
        .enumerate()
    {
        let data = payload(len, seed as u64);
        let sender = ChunkedPacketSender::builder()
            .chunk_size(1024)
            .transfer_channel("test")
            .source(Cursor::new(data.clone()))
            .to_channel(channel.clone())
            .build()
            .unwrap();
        let session = sender.descriptor().session_id();

        assert!(sender.transfer_blocking().is_success(), "len {len}");
        assert_eq!(node.received_for(session).unwrap().as_ref(), data.as_slice(), "len {len}");
    }

    assert_eq!(node.listener.active_sessions(), 0);
    // ceil((len + 1) / 1024) chunks per transfer.
    assert_eq!(channel.sent(), 1 + 1 + 1 + 2 + 2 + 3 + 3 + 6);
}

#[test]
fn multicast_reaches_every_node_once() {
    let nodes: Vec<MemoryNode> = (0..3).map(|_| MemoryNode::new()).collect();
    let channels: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| n.channel(&format!("node-{i}")))
        .collect();
    let data = payload(10_000, 7);

    let sender = ChunkedPacketSender::builder()
        .chunk_size(4096)
        .transfer_channel("test")
        .source(Cursor::new(data.clone()))
        .to_channels(as_channels(&channels))
        .build()
        .unwrap();
    let session = sender.descriptor().session_id();
    assert!(sender.transfer_blocking().is_success());

    for node in &nodes {
        let received = node.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, session);
        assert_eq!(received[0].1.as_ref(), data.as_slice());
    }
    for channel in &channels {
        assert_eq!(channel.sent(), 3);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_to_one_node() {
    let node = MemoryNode::new();
    let channel = node.channel("node-b");

    let mut tasks = Vec::new();
    for seed in 0..8u64 {
        let data = payload(3000 + seed as usize * 517, seed);
        let task = ChunkedPacketSender::builder()
            .chunk_size(256)
            .transfer_channel("test")
            .source(Cursor::new(data.clone()))
            .to_channel(channel.clone())
            .build()
            .unwrap()
            .transfer();
        tasks.push((task.session_id(), data, task));
    }

    for (session, data, task) in tasks {
        assert!(task.await.is_success());
        assert_eq!(node.received_for(session).unwrap().as_ref(), data.as_slice());
    }
    assert_eq!(node.received().len(), 8);
    assert_eq!(node.listener.active_sessions(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn file_transfer_reaches_waiter() {
    let spool = tempfile::tempdir().unwrap();
    let waiter = FileCallbackListener::new();
    let registry = HandlerRegistry::new();
    registry.register(
        "deploy_single_file",
        Arc::new(FileChunkHandlerFactory::new(spool.path(), Arc::new(waiter.clone()))),
    );
    let listener = Arc::new(ChunkedPacketListener::new(Arc::new(registry)));
    let channel = Arc::new(fleet_transfer::LocalChannel::new("node-b", listener));

    let data = payload(70_000, 42);
    let session = Uuid::new_v4();
    let pending = waiter.start_session(session);

    let status = ChunkedPacketSender::for_file_transfer()
        .chunk_size(16 * 1024)
        .session_id(session)
        .transfer_channel("deploy_single_file")
        .source(Cursor::new(data.clone()))
        .to_channel(channel)
        .build()
        .unwrap()
        .transfer()
        .wait_timeout(Duration::from_secs(10), TransferStatus::Cancelled)
        .await;
    assert!(status.is_success());

    let file = pending.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(file.size, data.len() as u64);
    assert_eq!(file.digest, *blake3::hash(&data).as_bytes());
    assert_eq!(file.read().unwrap(), data);
}
