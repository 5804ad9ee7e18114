//! Partial failures, cancellation and sessions that never finish.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use fleet_transfer::{
    ChunkedPacketListener, ChunkedPacketSender, HandlerRegistry, LocalChannel, SplitError,
    TransferError, TransferStatus,
};

use crate::{as_channels, payload, MemoryNode};

#[test]
fn closed_destination_fails_transfer_after_trying_all() {
    let nodes: Vec<MemoryNode> = (0..3).map(|_| MemoryNode::new()).collect();
    let channels: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| n.channel(&format!("node-{i}")))
        .collect();
    channels[1].close();

    let status = ChunkedPacketSender::builder()
        .chunk_size(1024)
        .transfer_channel("test")
        .source(Cursor::new(payload(4000, 1)))
        .to_channels(as_channels(&channels))
        .build()
        .unwrap()
        .transfer_blocking();

    match status {
        TransferStatus::Failure(TransferError::Split {
            chunk_index: 0,
            source: SplitError::Channel { channel, failed: 1, attempted: 3, .. },
        }) => assert_eq!(channel, "node-1"),
        other => panic!("unexpected status: {other}"),
    }

    // The healthy nodes got chunk 0 and are left with an open session.
    for i in [0, 2] {
        assert_eq!(channels[i].sent(), 1);
        assert_eq!(nodes[i].listener.active_sessions(), 1);
        assert!(nodes[i].received().is_empty());
        assert_eq!(nodes[i].listener.sweep_idle(Duration::ZERO), 1);
        assert_eq!(nodes[i].listener.active_sessions(), 0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_transfer_leaves_session_for_sweeper() {
    let node = MemoryNode::new();
    let task = ChunkedPacketSender::builder()
        .chunk_size(64)
        .transfer_channel("test")
        .source(std::io::repeat(0xab))
        .to_channel(node.channel("node-b"))
        .build()
        .unwrap()
        .transfer();

    tokio::time::sleep(Duration::from_millis(20)).await;
    task.cancel();
    let status = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap();
    assert!(status.is_cancelled());

    assert!(node.received().is_empty());
    assert!(node.listener.active_sessions() <= 1);
    node.listener.sweep_idle(Duration::ZERO);
    assert_eq!(node.listener.active_sessions(), 0);
}

#[test]
fn unregistered_transfer_channel_is_dropped_by_receiver() {
    let listener = Arc::new(ChunkedPacketListener::new(Arc::new(HandlerRegistry::new())));
    let channel = Arc::new(LocalChannel::new("node-b", listener.clone()));

    let sender = ChunkedPacketSender::builder()
        .chunk_size(16)
        .transfer_channel("nobody_listens")
        .source(Cursor::new(payload(40, 3)))
        .to_channel(channel.clone())
        .build()
        .unwrap();
    let session = sender.descriptor().session_id();

    // The sender has no acknowledgement path, so it still succeeds.
    assert!(sender.transfer_blocking().is_success());
    assert_eq!(channel.sent(), 3);
    assert_eq!(listener.active_sessions(), 0);
    assert!(listener.is_retired(session));
}
