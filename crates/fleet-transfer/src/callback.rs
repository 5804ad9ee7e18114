//! Completion waiters — lets a caller await a file it asked a peer to send.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::file_handler::{CompletedTransfer, TransferCallback};

type Waiters = Arc<DashMap<Uuid, oneshot::Sender<CompletedTransfer>>>;

/// Routes completed transfers to whoever announced the session.
///
/// Register with [`start_session`](Self::start_session) before the first
/// chunk can arrive. Transfers nobody waits for are dropped, which removes
/// their temp file.
#[derive(Default, Clone)]
pub struct FileCallbackListener {
    waiters: Waiters,
}

impl FileCallbackListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce an expected session. A previous waiter for the same id is
    /// replaced and will resolve to `None`.
    pub fn start_session(&self, session_id: Uuid) -> PendingFile {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(session_id, tx);
        PendingFile {
            session_id,
            rx,
            waiters: self.waiters.clone(),
        }
    }

    /// Stop waiting for a session. Returns false if nobody was waiting.
    pub fn stop_session(&self, session_id: Uuid) -> bool {
        self.waiters.remove(&session_id).is_some()
    }

    pub fn is_waiting(&self, session_id: Uuid) -> bool {
        self.waiters.contains_key(&session_id)
    }

    /// Register and wait in one step.
    pub async fn wait_for_file(&self, session_id: Uuid, timeout: Duration) -> Option<CompletedTransfer> {
        self.start_session(session_id).wait(timeout).await
    }
}

impl TransferCallback for FileCallbackListener {
    fn on_complete(&self, transfer: CompletedTransfer) {
        let session_id = transfer.descriptor.session_id();
        match self.waiters.remove(&session_id) {
            Some((_, tx)) => {
                if tx.send(transfer).is_err() {
                    tracing::debug!(session = %session_id, "waiter gone, dropping received file");
                }
            }
            None => tracing::debug!(session = %session_id, "no waiter for received file, dropping it"),
        }
    }
}

/// A file announced with [`FileCallbackListener::start_session`].
pub struct PendingFile {
    session_id: Uuid,
    rx: oneshot::Receiver<CompletedTransfer>,
    waiters: Waiters,
}

impl PendingFile {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Resolve to the file, or `None` on timeout or when the wait was stopped.
    pub async fn wait(mut self, timeout: Duration) -> Option<CompletedTransfer> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(transfer)) => Some(transfer),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(session = %self.session_id, ?timeout, "timed out waiting for file");
                None
            }
        }
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        // Closing our receiver marks our sender closed; a registration that
        // replaced ours still has an open one and is kept.
        self.rx.close();
        self.waiters.remove_if(&self.session_id, |_, tx| tx.is_closed());
    }
}
