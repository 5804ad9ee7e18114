//! Deployments between `fleetd` nodes over loopback TCP.

use std::io::Write;

use fleetd::deploy::DeployTarget;
use fleetd::push::push_file;

use crate::{payload, TcpNode};

const CHUNK: u32 = 4096;

fn source_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn push_deploys_file_to_every_peer() {
    let a = TcpNode::start(CHUNK).await.unwrap();
    let b = TcpNode::start(CHUNK).await.unwrap();
    let data = payload(50_000, 11);
    let file = source_file(&data);

    push_file(
        &a.settings,
        file.path(),
        DeployTarget::new("plugins/fleet.jar", false),
        &[a.addr.clone(), b.addr.clone()],
    )
    .await
    .unwrap();

    a.wait_for_file("plugins/fleet.jar", &data).await.unwrap();
    b.wait_for_file("plugins/fleet.jar", &data).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exact_chunk_multiple_and_append() {
    let node = TcpNode::start(CHUNK).await.unwrap();
    let first = payload(CHUNK as usize * 2, 1);
    let second = payload(100, 2);

    for (data, append) in [(&first, false), (&second, true)] {
        let file = source_file(data);
        push_file(
            &node.settings,
            file.path(),
            DeployTarget::new("logs/latest.log", append),
            &[node.addr.clone()],
        )
        .await
        .unwrap();
        if !append {
            node.wait_for_file("logs/latest.log", &first).await.unwrap();
        }
    }

    let expected: Vec<u8> = first.iter().chain(second.iter()).copied().collect();
    node.wait_for_file("logs/latest.log", &expected).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unsafe_target_is_refused_before_sending() {
    let node = TcpNode::start(CHUNK).await.unwrap();
    let file = source_file(b"x");
    let result = push_file(
        &node.settings,
        file.path(),
        DeployTarget::new("../escape", false),
        &[node.addr.clone()],
    )
    .await;
    assert!(result.is_err());
    assert_eq!(node.node.receiver.active_sessions(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_peer_fails_push() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let node = TcpNode::start(CHUNK).await.unwrap();
    let file = source_file(b"data");
    let result = push_file(&node.settings, file.path(), DeployTarget::new("a.txt", false), &[addr]).await;
    assert!(result.is_err());
}
