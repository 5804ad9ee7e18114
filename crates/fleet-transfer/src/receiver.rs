//! Chunked receiver — demultiplexes chunk packets into per-session handlers.
//!
//! The registry maps a session descriptor (identity by session id) to its
//! live handler. Lookup-or-create runs under the map's entry lock, so two
//! chunks of a new session never build two handlers. Finished, failed and
//! swept sessions are remembered for a while as *retired*: later chunks for
//! them, such as a duplicated terminal chunk, are ignored.
//!
//! Handlers and factories run application code; a panic inside them fails
//! that session only and never unwinds into the caller.
//!
//! Lock order: a session's mutex is only taken after the map guard that
//! produced it was dropped, and the sweeper only `try_lock`s sessions.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use fleet_core::session::DecodeError;
use fleet_core::{ChunkPacket, ChunkSessionDescriptor, Packet};

use crate::channel::PacketListener;
use crate::handler::{ChunkHandler, ChunkHandlerFactory, HandlerError};

/// How long completed session ids are remembered by default.
pub const DEFAULT_RETIRED_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk stored; the session is still open.
    Accepted,
    /// Terminal chunk stored; the session was closed.
    Completed,
    /// The session is already retired; nothing happened.
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("malformed chunk frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("no handler for session {session}: {source}")]
    Factory {
        session: Uuid,
        #[source]
        source: HandlerError,
    },

    #[error("session {session} failed at chunk {chunk_index}: {source}")]
    Handler {
        session: Uuid,
        chunk_index: u32,
        #[source]
        source: HandlerError,
    },

    #[error("chunk for session {session} carries different session parameters")]
    DescriptorMismatch { session: Uuid },
}

struct ActiveSession {
    descriptor: ChunkSessionDescriptor,
    handler: Box<dyn ChunkHandler>,
    last_seen: Instant,
    chunks: u32,
    closed: bool,
}

pub struct ChunkedPacketListener {
    factory: Arc<dyn ChunkHandlerFactory>,
    sessions: DashMap<ChunkSessionDescriptor, Arc<Mutex<ActiveSession>>>,
    retired: DashMap<Uuid, Instant>,
    retired_ttl: Duration,
    last_pruned: Mutex<Instant>,
}

impl ChunkedPacketListener {
    /// `factory` is called while the session's registry shard is locked and
    /// must not call back into this listener.
    pub fn new(factory: Arc<dyn ChunkHandlerFactory>) -> Self {
        Self {
            factory,
            sessions: DashMap::new(),
            retired: DashMap::new(),
            retired_ttl: DEFAULT_RETIRED_TTL,
            last_pruned: Mutex::new(Instant::now()),
        }
    }

    pub fn with_retired_ttl(mut self, ttl: Duration) -> Self {
        self.retired_ttl = ttl;
        self
    }

    /// Decode a packet's content as a chunk frame and process it.
    pub fn handle_packet(&self, mut packet: Packet) -> Result<ChunkOutcome, ReceiveError> {
        let chunk = ChunkPacket::decode(&mut packet.content)?;
        self.handle_chunk(chunk)
    }

    pub fn handle_chunk(&self, chunk: ChunkPacket) -> Result<ChunkOutcome, ReceiveError> {
        let session_id = chunk.descriptor.session_id();
        if self.is_retired(session_id) {
            tracing::trace!(session = %session_id, chunk_index = chunk.chunk_index, "chunk for retired session ignored");
            return Ok(ChunkOutcome::Ignored);
        }

        let session = match self.sessions.entry(chunk.descriptor.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // Retired between the check above and taking the shard lock.
                if self.is_retired(session_id) {
                    return Ok(ChunkOutcome::Ignored);
                }
                let created = catch_unwind(AssertUnwindSafe(|| {
                    self.factory.create_handler(&chunk.descriptor)
                }))
                .unwrap_or(Err(HandlerError::Panicked));
                let handler = match created {
                    Ok(handler) => handler,
                    Err(source) => {
                        self.retire(session_id);
                        return Err(ReceiveError::Factory {
                            session: session_id,
                            source,
                        });
                    }
                };
                tracing::debug!(
                    session = %session_id,
                    transfer_channel = chunk.descriptor.transfer_channel(),
                    chunk_size = chunk.descriptor.chunk_size(),
                    "chunk session opened"
                );
                let session = Arc::new(Mutex::new(ActiveSession {
                    descriptor: chunk.descriptor.clone(),
                    handler,
                    last_seen: Instant::now(),
                    chunks: 0,
                    closed: false,
                }));
                entry.insert(session.clone());
                session
            }
        };

        let mut active = session.lock().unwrap_or_else(PoisonError::into_inner);
        if active.closed {
            return Ok(ChunkOutcome::Ignored);
        }

        if !active.descriptor.same_parameters(&chunk.descriptor) {
            tracing::warn!(session = %session_id, "descriptor mismatch, dropping session");
            active.closed = true;
            abort_handler(active.handler.as_mut());
            drop(active);
            self.close(&chunk.descriptor);
            return Err(ReceiveError::DescriptorMismatch {
                session: session_id,
            });
        }

        active.last_seen = Instant::now();
        let handled = catch_unwind(AssertUnwindSafe(|| {
            active.handler.handle_chunk_part(chunk.chunk_index, chunk.payload)
        }))
        .unwrap_or(Err(HandlerError::Panicked));
        match handled {
            Ok(false) => {
                active.chunks += 1;
                Ok(ChunkOutcome::Accepted)
            }
            Ok(true) => {
                active.chunks += 1;
                active.closed = true;
                tracing::debug!(session = %session_id, chunks = active.chunks, "chunk session completed");
                drop(active);
                self.close(&chunk.descriptor);
                Ok(ChunkOutcome::Completed)
            }
            Err(source) => {
                active.closed = true;
                abort_handler(active.handler.as_mut());
                drop(active);
                self.close(&chunk.descriptor);
                Err(ReceiveError::Handler {
                    session: session_id,
                    chunk_index: chunk.chunk_index,
                    source,
                })
            }
        }
    }

    /// Abort sessions that saw no chunk for at least `max_idle` and forget
    /// expired retired ids. Returns the number of sessions reclaimed.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        self.prune_retired(now);

        let stale: Vec<ChunkSessionDescriptor> = self
            .sessions
            .iter()
            .filter(|entry| is_idle(entry.value(), now, max_idle))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reclaimed = 0;
        for descriptor in stale {
            let removed = self.sessions.remove_if(&descriptor, |key, session| {
                let idle = is_idle(session, now, max_idle);
                if idle {
                    self.retired.insert(key.session_id(), now);
                }
                idle
            });
            let Some((_, session)) = removed else { continue };

            let mut active = session.lock().unwrap_or_else(PoisonError::into_inner);
            if active.closed {
                continue;
            }
            active.closed = true;
            abort_handler(active.handler.as_mut());
            reclaimed += 1;
            tracing::info!(
                session = %descriptor.session_id(),
                transfer_channel = descriptor.transfer_channel(),
                chunks = active.chunks,
                "idle chunk session reclaimed"
            );
        }
        reclaimed
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains_session(&self, session_id: Uuid) -> bool {
        self.sessions.iter().any(|e| e.key().session_id() == session_id)
    }

    pub fn is_retired(&self, session_id: Uuid) -> bool {
        self.retired
            .get(&session_id)
            .is_some_and(|at| at.elapsed() < self.retired_ttl)
    }

    fn retire(&self, session_id: Uuid) {
        let now = Instant::now();
        // At most one prune per TTL, so listeners without a sweeper stay bounded.
        let due = match self.last_pruned.try_lock() {
            Ok(mut last) if now.saturating_duration_since(*last) >= self.retired_ttl => {
                *last = now;
                true
            }
            _ => false,
        };
        if due {
            self.prune_retired(now);
        }
        self.retired.insert(session_id, now);
    }

    fn prune_retired(&self, now: Instant) {
        self.retired
            .retain(|_, retired_at| now.saturating_duration_since(*retired_at) < self.retired_ttl);
    }

    /// Retire first so a racing first-chunk path cannot recreate the session.
    fn close(&self, descriptor: &ChunkSessionDescriptor) {
        self.retire(descriptor.session_id());
        self.sessions.remove(descriptor);
    }
}

fn abort_handler(handler: &mut dyn ChunkHandler) {
    if catch_unwind(AssertUnwindSafe(|| handler.abort())).is_err() {
        tracing::warn!("chunk handler panicked while aborting");
    }
}

/// Idle check that never blocks on a session in use.
fn is_idle(session: &Mutex<ActiveSession>, now: Instant, max_idle: Duration) -> bool {
    let last_seen = match session.try_lock() {
        Ok(active) => active.last_seen,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().last_seen,
        Err(TryLockError::WouldBlock) => return false,
    };
    now.saturating_duration_since(last_seen) >= max_idle
}

impl PacketListener for ChunkedPacketListener {
    fn handle(&self, packet: Packet) {
        match self.handle_packet(packet) {
            Ok(outcome) => tracing::trace!(?outcome, "chunk packet handled"),
            Err(e) => tracing::warn!(error = %e, "chunk packet rejected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::memory_handler::{MemoryChunkHandlerFactory, MemorySink};
    use crate::registry::HandlerRegistry;

    type Received = Arc<Mutex<Vec<(Uuid, Bytes)>>>;

    fn listener() -> (Received, ChunkedPacketListener) {
        let received: Received = Arc::default();
        let inner = received.clone();
        let sink: MemorySink = Arc::new(move |d: ChunkSessionDescriptor, data: Bytes| {
            inner.lock().unwrap().push((d.session_id(), data))
        });
        let factory = Arc::new(MemoryChunkHandlerFactory::new(sink));
        (received, ChunkedPacketListener::new(factory))
    }

    fn descriptor(chunk_size: u32) -> ChunkSessionDescriptor {
        ChunkSessionDescriptor::new(Uuid::new_v4(), chunk_size, "test", Bytes::new())
    }

    fn packets(descriptor: &ChunkSessionDescriptor, data: &[u8]) -> Vec<Packet> {
        let size = descriptor.chunk_size() as usize;
        let mut out: Vec<Packet> = data
            .chunks(size)
            .enumerate()
            .map(|(i, c)| ChunkPacket::frame(descriptor, i as u32, c))
            .collect();
        if data.len() % size == 0 {
            out.push(ChunkPacket::frame(descriptor, (data.len() / size) as u32, &[]));
        }
        out
    }

    fn outcomes(listener: &ChunkedPacketListener, packets: Vec<Packet>) -> Vec<ChunkOutcome> {
        packets
            .into_iter()
            .map(|p| listener.handle_packet(p).unwrap())
            .collect()
    }

    #[test]
    fn short_tail_completes_session() {
        let (received, listener) = listener();
        let d = descriptor(1024);
        let data: Vec<u8> = (0..2600u32).map(|i| (i % 253) as u8).collect();

        let results = outcomes(&listener, packets(&d, &data));
        assert_eq!(
            results,
            vec![ChunkOutcome::Accepted, ChunkOutcome::Accepted, ChunkOutcome::Completed]
        );
        assert_eq!(received.lock().unwrap().as_slice(), &[(d.session_id(), Bytes::from(data))]);
        assert_eq!(listener.active_sessions(), 0);
        assert!(listener.is_retired(d.session_id()));
    }

    #[test]
    fn exact_multiple_completes_on_empty_chunk() {
        let (received, listener) = listener();
        let d = descriptor(1024);
        let results = outcomes(&listener, packets(&d, &[3u8; 2048]));
        assert_eq!(
            results,
            vec![ChunkOutcome::Accepted, ChunkOutcome::Accepted, ChunkOutcome::Completed]
        );
        assert_eq!(received.lock().unwrap()[0].1.len(), 2048);
    }

    #[test]
    fn duplicate_terminal_chunk_is_ignored() {
        let (received, listener) = listener();
        let d = descriptor(8);
        let terminal = ChunkPacket::frame(&d, 0, b"abc");
        let duplicate = ChunkPacket::frame(&d, 0, b"abc");

        assert_eq!(listener.handle_packet(terminal).unwrap(), ChunkOutcome::Completed);
        assert_eq!(listener.handle_packet(duplicate).unwrap(), ChunkOutcome::Ignored);
        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(listener.active_sessions(), 0);
    }

    #[test]
    fn interleaved_sessions_stay_isolated() {
        let (received, listener) = listener();
        let a = descriptor(4);
        let b = descriptor(4);
        let mut pa = packets(&a, b"aaaaaaaaa").into_iter();
        let mut pb = packets(&b, b"bbbbbb").into_iter();

        listener.handle_packet(pa.next().unwrap()).unwrap();
        listener.handle_packet(pb.next().unwrap()).unwrap();
        listener.handle_packet(pa.next().unwrap()).unwrap();
        assert_eq!(listener.active_sessions(), 2);
        assert_eq!(listener.handle_packet(pb.next().unwrap()).unwrap(), ChunkOutcome::Completed);
        assert_eq!(listener.handle_packet(pa.next().unwrap()).unwrap(), ChunkOutcome::Completed);

        let received = received.lock().unwrap();
        let find = |id: Uuid| received.iter().find(|(s, _)| *s == id).unwrap().1.clone();
        assert_eq!(find(a.session_id()), Bytes::from_static(b"aaaaaaaaa"));
        assert_eq!(find(b.session_id()), Bytes::from_static(b"bbbbbb"));
    }

    #[test]
    fn mismatched_descriptor_drops_session() {
        let (received, listener) = listener();
        let d = descriptor(4);
        let other = ChunkSessionDescriptor::new(d.session_id(), 8, "test", Bytes::new());

        listener.handle_packet(ChunkPacket::frame(&d, 0, b"abcd")).unwrap();
        assert!(listener.contains_session(d.session_id()));

        let err = listener
            .handle_packet(ChunkPacket::frame(&other, 1, b"abcd"))
            .unwrap_err();
        assert!(matches!(err, ReceiveError::DescriptorMismatch { session } if session == d.session_id()));
        assert!(!listener.contains_session(d.session_id()));
        assert_eq!(
            listener.handle_packet(ChunkPacket::frame(&d, 1, b"ab")).unwrap(),
            ChunkOutcome::Ignored
        );
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn factory_failure_leaves_no_entry() {
        let listener = ChunkedPacketListener::new(Arc::new(HandlerRegistry::new()));
        let d = descriptor(4);
        let err = listener
            .handle_packet(ChunkPacket::frame(&d, 0, b"abcd"))
            .unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::Factory { source: HandlerError::UnknownTransferChannel(_), .. }
        ));
        assert_eq!(listener.active_sessions(), 0);
        assert!(listener.is_retired(d.session_id()));
    }

    #[test]
    fn out_of_order_chunk_fails_session() {
        let (_, listener) = listener();
        let d = descriptor(4);
        listener.handle_packet(ChunkPacket::frame(&d, 0, b"abcd")).unwrap();
        let err = listener
            .handle_packet(ChunkPacket::frame(&d, 2, b"abcd"))
            .unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::Handler { chunk_index: 2, source: HandlerError::OutOfOrder { .. }, .. }
        ));
        assert_eq!(listener.active_sessions(), 0);
    }

    #[test]
    fn malformed_frame_does_not_disturb_other_sessions() {
        let (received, listener) = listener();
        let d = descriptor(4);
        listener.handle_packet(ChunkPacket::frame(&d, 0, b"abcd")).unwrap();

        let garbage = Packet::new(fleet_core::packet::CHUNKED_TRANSFER_CHANNEL, vec![1u8, 2, 3].into());
        assert!(matches!(listener.handle_packet(garbage), Err(ReceiveError::Decode(_))));

        assert_eq!(
            listener.handle_packet(ChunkPacket::frame(&d, 1, b"e")).unwrap(),
            ChunkOutcome::Completed
        );
        assert_eq!(received.lock().unwrap()[0].1, Bytes::from_static(b"abcde"));
    }

    #[test]
    fn sweep_reclaims_idle_sessions() {
        let (received, listener) = listener();
        let d = descriptor(4);
        listener.handle_packet(ChunkPacket::frame(&d, 0, b"abcd")).unwrap();

        assert_eq!(listener.sweep_idle(Duration::from_secs(3600)), 0);
        assert_eq!(listener.active_sessions(), 1);

        assert_eq!(listener.sweep_idle(Duration::ZERO), 1);
        assert_eq!(listener.active_sessions(), 0);
        assert_eq!(
            listener.handle_packet(ChunkPacket::frame(&d, 1, b"ef")).unwrap(),
            ChunkOutcome::Ignored
        );
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn retired_ids_expire() {
        let (_, listener) = listener();
        let listener = listener.with_retired_ttl(Duration::ZERO);
        let d = descriptor(4);
        listener.handle_packet(ChunkPacket::frame(&d, 0, b"ab")).unwrap();
        assert!(!listener.is_retired(d.session_id()));
        listener.sweep_idle(Duration::from_secs(3600));
        assert!(listener.retired.is_empty());
    }

    #[test]
    fn panicking_sink_fails_only_its_session() {
        let sink: MemorySink = Arc::new(|_: ChunkSessionDescriptor, _: Bytes| panic!("sink failure"));
        let listener = ChunkedPacketListener::new(Arc::new(MemoryChunkHandlerFactory::new(sink)));
        let d = descriptor(4);
        let other = descriptor(4);
        listener.handle_packet(ChunkPacket::frame(&other, 0, b"abcd")).unwrap();

        listener.handle(ChunkPacket::frame(&d, 0, b"ab"));
        assert_eq!(listener.active_sessions(), 1);
        assert!(listener.is_retired(d.session_id()));
        assert!(!listener.is_retired(other.session_id()));

        let err = listener
            .handle_packet(ChunkPacket::frame(&other, 1, b"e"))
            .unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::Handler { chunk_index: 1, source: HandlerError::Panicked, .. }
        ));
        assert_eq!(listener.active_sessions(), 0);
    }

    #[test]
    fn panicking_factory_is_a_factory_error() {
        let factory = |_: &ChunkSessionDescriptor| -> Result<Box<dyn ChunkHandler>, HandlerError> {
            panic!("factory failure")
        };
        let listener = ChunkedPacketListener::new(Arc::new(factory));
        let d = descriptor(4);
        let err = listener
            .handle_packet(ChunkPacket::frame(&d, 0, b"ab"))
            .unwrap_err();
        assert!(matches!(err, ReceiveError::Factory { source: HandlerError::Panicked, .. }));
        assert_eq!(listener.active_sessions(), 0);
        assert!(listener.is_retired(d.session_id()));
    }

    #[test]
    fn retired_ids_stay_bounded_without_sweeps() {
        let (_, listener) = listener();
        let listener = listener.with_retired_ttl(Duration::ZERO);
        for _ in 0..1000 {
            let d = descriptor(4);
            assert_eq!(
                listener.handle_packet(ChunkPacket::frame(&d, 0, b"ab")).unwrap(),
                ChunkOutcome::Completed
            );
        }
        assert!(listener.retired.len() <= 1);
    }

    #[test]
    fn concurrent_first_chunks_build_one_handler() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let sink: MemorySink = Arc::new(|_: ChunkSessionDescriptor, _: Bytes| {});
        let memory = MemoryChunkHandlerFactory::new(sink);
        let factory = move |d: &ChunkSessionDescriptor| -> Result<Box<dyn ChunkHandler>, HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            memory.create_handler(d)
        };
        let listener = Arc::new(ChunkedPacketListener::new(Arc::new(factory)));
        let d = descriptor(4);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let listener = listener.clone();
                let packet = ChunkPacket::frame(&d, 0, b"abcd");
                std::thread::spawn(move || {
                    let _ = listener.handle_packet(packet);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
    }
}
