//! Idle sweeper — reclaims chunk sessions whose sender went quiet.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use fleet_transfer::ChunkedPacketListener;

pub struct IdleSweeper {
    listener: Arc<ChunkedPacketListener>,
    interval: Duration,
    max_idle: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl IdleSweeper {
    pub fn new(
        listener: Arc<ChunkedPacketListener>,
        interval: Duration,
        max_idle: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            interval,
            max_idle,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("idle sweeper shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    let listener = self.listener.clone();
                    let max_idle = self.max_idle;
                    // Aborting handlers deletes temp files.
                    let reclaimed = tokio::task::spawn_blocking(move || listener.sweep_idle(max_idle)).await?;
                    if reclaimed > 0 {
                        tracing::info!(
                            reclaimed,
                            active = self.listener.active_sessions(),
                            "idle chunk sessions reclaimed"
                        );
                    }
                }
            }
        }
    }
}
