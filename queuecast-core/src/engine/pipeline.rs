//! Per-chunk routing from capture into the transport log and playback queue.
//!
//! Runs on the capture delivery thread. For each chunk:
//!
//! ```text
//! AudioChunk ──encode──► TransportLog (when recording)
//!      │
//!      └──enqueue──► PlaybackSession ──► ChunkCapturedEvent
//! ```

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::buffering::{chunk::AudioChunk, merge::TransportLog};
use crate::ipc::events::ChunkCapturedEvent;
use crate::playback::{player::PlayerCountersSnapshot, PlaybackSession};

/// Counters updated by the chunk router.
#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub chunks_captured: AtomicUsize,
    pub frames_captured: AtomicUsize,
    pub chunks_enqueued: AtomicUsize,
    pub enqueue_errors: AtomicUsize,
    pub transport_bytes: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.chunks_captured.store(0, Ordering::Relaxed);
        self.frames_captured.store(0, Ordering::Relaxed);
        self.chunks_enqueued.store(0, Ordering::Relaxed);
        self.enqueue_errors.store(0, Ordering::Relaxed);
        self.transport_bytes.store(0, Ordering::Relaxed);
    }

    /// Combine the router counters with the player's.
    pub fn snapshot(&self, player: PlayerCountersSnapshot) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_captured: self.chunks_captured.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            chunks_enqueued: self.chunks_enqueued.load(Ordering::Relaxed),
            enqueue_errors: self.enqueue_errors.load(Ordering::Relaxed),
            transport_bytes: self.transport_bytes.load(Ordering::Relaxed),
            entries_enqueued: player.entries_enqueued,
            entries_finished: player.entries_finished,
            drains: player.drains,
            stale_events: player.stale_events,
        }
    }
}

/// Point-in-time copy of the engine counters.
///
/// Capture-side counters reset with every `start_capture`; player counters
/// accumulate over the engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub chunks_captured: usize,
    pub frames_captured: usize,
    pub chunks_enqueued: usize,
    pub enqueue_errors: usize,
    pub transport_bytes: usize,
    pub entries_enqueued: usize,
    pub entries_finished: usize,
    pub drains: usize,
    pub stale_events: usize,
}

/// Everything the capture handler needs, bundled so the closure stays tidy.
pub struct ChunkRouter {
    pub session: Arc<PlaybackSession>,
    pub transport: Arc<TransportLog>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub chunk_tx: broadcast::Sender<ChunkCapturedEvent>,
    pub record_transport: bool,
}

impl ChunkRouter {
    pub fn route(&self, chunk: AudioChunk) {
        let index = chunk.index;
        let frames = chunk.frames();
        let duration_ms = chunk.duration_secs() * 1000.0;
        self.diagnostics
            .chunks_captured
            .fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .frames_captured
            .fetch_add(frames, Ordering::Relaxed);

        if self.record_transport {
            let encoded = chunk.encode();
            self.diagnostics
                .transport_bytes
                .fetch_add(encoded.as_str().len(), Ordering::Relaxed);
            self.transport.push(encoded);
        }

        let buffer_id = match self.session.enqueue(chunk) {
            Ok(id) => {
                self.diagnostics
                    .chunks_enqueued
                    .fetch_add(1, Ordering::Relaxed);
                debug!(index, frames, %id, "captured chunk enqueued");
                Some(id)
            }
            Err(e) => {
                self.diagnostics
                    .enqueue_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(index, "failed to enqueue captured chunk: {e}");
                None
            }
        };

        let _ = self.chunk_tx.send(ChunkCapturedEvent {
            index,
            frames,
            duration_ms,
            buffer_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{BufferId, OfflineOutput};

    fn router(record: bool) -> (ChunkRouter, broadcast::Receiver<ChunkCapturedEvent>) {
        let session = Arc::new(PlaybackSession::new(Arc::new(OfflineOutput::new(1))));
        let (chunk_tx, rx) = broadcast::channel(8);
        (
            ChunkRouter {
                session,
                transport: Arc::new(TransportLog::new()),
                diagnostics: Arc::new(PipelineDiagnostics::default()),
                chunk_tx,
                record_transport: record,
            },
            rx,
        )
    }

    #[test]
    fn routed_chunk_is_recorded_enqueued_and_announced() {
        let (router, mut rx) = router(true);
        router.session.start_session(1_000).unwrap();
        router.route(AudioChunk::mono(vec![0.1; 250], 1_000).with_index(0));

        assert_eq!(router.transport.len(), 1);
        assert_eq!(router.session.player().pending_entries(), 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.frames, 250);
        assert_eq!(event.buffer_id, Some(BufferId(1)));
        assert!((event.duration_ms - 250.0).abs() < 1e-9);

        let snap = router
            .diagnostics
            .snapshot(router.session.player().counters());
        assert_eq!(snap.chunks_captured, 1);
        assert_eq!(snap.frames_captured, 250);
        assert_eq!(snap.chunks_enqueued, 1);
        assert!(snap.transport_bytes > 0);
    }

    #[test]
    fn enqueue_failure_is_counted_not_fatal() {
        let (router, mut rx) = router(false);
        router.route(AudioChunk::mono(vec![0.0; 10], 1_000));
        assert!(router.transport.is_empty());
        assert_eq!(
            router.diagnostics.enqueue_errors.load(Ordering::Relaxed),
            1
        );
        assert_eq!(rx.try_recv().unwrap().buffer_id, None);
    }

    #[test]
    fn reset_zeroes_router_counters() {
        let diagnostics = PipelineDiagnostics::default();
        diagnostics.chunks_captured.store(3, Ordering::Relaxed);
        diagnostics.reset();
        let snap = diagnostics.snapshot(PlayerCountersSnapshot::default());
        assert_eq!(snap, DiagnosticsSnapshot::default());
    }
}
