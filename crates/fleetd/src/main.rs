//! fleetd — fleet node daemon.
//!
//!   fleetd [listen [addr]]
//!   fleetd push [--append] <file> <target> [addr...]

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;

use fleet_core::config::FleetConfig;
use fleetd::deploy::DeployTarget;
use fleetd::sweeper::IdleSweeper;
use fleetd::{push, transport, Node};

const USAGE: &str = "usage: fleetd [listen [addr]] | push [--append] <file> <target> [addr...]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = FleetConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FleetConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FleetConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("listen") => listen(config, args.get(1).cloned()).await,
        Some("push") => push_command(config, &args[1..]).await,
        Some(other) => {
            eprintln!("{USAGE}");
            bail!("unknown command {other:?}")
        }
    }
}

async fn listen(config: FleetConfig, addr: Option<String>) -> Result<()> {
    let addr = addr.unwrap_or(config.network.listen_addr);
    let settings = config.transfer;
    tracing::info!(
        addr,
        storage = %settings.storage_path.display(),
        spool = %settings.temp_dir.display(),
        chunk_size = settings.chunk_size,
        "fleetd starting"
    );

    let node = Node::new(&settings);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let transport_task = tokio::spawn(transport::serve(
        listener,
        transport::max_frame_len(settings.chunk_size),
        node.dispatcher.clone(),
        shutdown_tx.subscribe(),
    ));

    let sweeper_task = tokio::spawn(
        IdleSweeper::new(
            node.receiver.clone(),
            settings.sweep_interval(),
            settings.session_idle_timeout(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = transport_task     => tracing::error!("transport exited: {:?}", r),
        r = sweeper_task       => tracing::error!("idle sweeper exited: {:?}", r),
    }

    Ok(())
}

async fn push_command(config: FleetConfig, args: &[String]) -> Result<()> {
    let (append, rest) = match args.first().map(String::as_str) {
        Some("--append") => (true, &args[1..]),
        _ => (false, args),
    };
    let [file, target, peers @ ..] = rest else {
        eprintln!("{USAGE}");
        bail!("push needs a file and a target path");
    };

    let peers: Vec<String> = if peers.is_empty() {
        config.network.peers.clone()
    } else {
        peers.to_vec()
    };

    push::push_file(
        &config.transfer,
        &PathBuf::from(file),
        DeployTarget::new(target.as_str(), append),
        &peers,
    )
    .await
}
