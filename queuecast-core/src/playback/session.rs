//! `PlaybackSession`: owns the output context and the single live queue sink.
//!
//! ## Lifecycle
//!
//! ```text
//! PlaybackSession::new()
//!     └─► start_session(rate)   → teardown of any previous session, then create_sink
//!         ├─► enqueue / play    → sink recreated on demand if stop() released it
//!         ├─► stop()            → sink released, context kept
//!         └─► end_session()     → sink + context released (idempotent, also on Drop)
//! ```
//!
//! Compound operations hold the session lock, so a capture thread enqueueing
//! never observes the gap between tearing down one sink and creating the next.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{AudioOutput, BufferId, BufferQueuePlayer, PlayerState};
use crate::buffering::chunk::AudioChunk;
use crate::error::{QueuecastError, Result};
use crate::ipc::events::PlaybackStatusEvent;

#[derive(Debug, Default)]
struct SessionInner {
    sample_rate: Option<u32>,
    active: bool,
}

pub struct PlaybackSession {
    player: BufferQueuePlayer,
    inner: Mutex<SessionInner>,
}

impl PlaybackSession {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            player: BufferQueuePlayer::new(output),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Open a context and sink at `sample_rate`, replacing any live session.
    ///
    /// # Errors
    /// `QueuecastError::Resource` if the output cannot be opened. Nothing is
    /// left allocated on failure.
    pub fn start_session(&self, sample_rate: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.active {
            info!("replacing active playback session");
            self.player.teardown();
            inner.active = false;
        }

        if let Err(e) = self.player.create_sink(sample_rate) {
            self.player.teardown();
            warn!("playback session failed to start: {e}");
            return Err(e);
        }
        inner.sample_rate = Some(sample_rate);
        inner.active = true;
        info!(sample_rate, "playback session started");
        Ok(())
    }

    /// Release the sink and the context. Safe to call repeatedly.
    pub fn end_session(&self) {
        let mut inner = self.inner.lock();
        self.player.teardown();
        if inner.active {
            info!("playback session ended");
        }
        inner.active = false;
    }

    pub fn enqueue(&self, chunk: AudioChunk) -> Result<BufferId> {
        let inner = self.inner.lock();
        self.ensure_sink(&inner)?;
        self.player.enqueue(chunk)
    }

    /// Start draining the queue.
    pub fn play(&self) -> Result<()> {
        let inner = self.inner.lock();
        self.ensure_sink(&inner)?;
        self.player.start()
    }

    /// Release the sink; the next `enqueue`/`play` creates a fresh one.
    pub fn stop(&self) {
        let _inner = self.inner.lock();
        self.player.reset();
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.inner.lock().sample_rate
    }

    pub fn state(&self) -> PlayerState {
        self.player.state()
    }

    pub fn is_playing(&self) -> bool {
        self.player.is_playing()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackStatusEvent> {
        self.player.subscribe()
    }

    pub fn player(&self) -> &BufferQueuePlayer {
        &self.player
    }

    fn ensure_sink(&self, inner: &SessionInner) -> Result<()> {
        if !inner.active {
            return Err(QueuecastError::InvalidState(
                "no active playback session".into(),
            ));
        }
        if self.player.state() == PlayerState::Empty {
            let Some(rate) = inner.sample_rate else {
                return Err(QueuecastError::InvalidState(
                    "playback session has no sample rate".into(),
                ));
            };
            self.player.create_sink(rate)?;
            debug!(rate, "queue sink recreated on demand");
        }
        Ok(())
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.end_session();
    }
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("inner", &*self.inner.lock())
            .field("player", &self.player)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::OfflineOutput;

    fn chunk(frames: usize) -> AudioChunk {
        AudioChunk::mono(vec![0.2; frames], 16_000)
    }

    #[test]
    fn operations_require_an_active_session() {
        let session = PlaybackSession::new(Arc::new(OfflineOutput::new(1)));
        assert!(matches!(
            session.enqueue(chunk(1)),
            Err(QueuecastError::InvalidState(_))
        ));
        assert!(matches!(session.play(), Err(QueuecastError::InvalidState(_))));
    }

    #[test]
    fn replacing_a_session_releases_the_previous_sink() {
        let output = Arc::new(OfflineOutput::new(1));
        let session = PlaybackSession::new(output.clone());
        session.start_session(16_000).unwrap();
        session.enqueue(chunk(8)).unwrap();
        session.play().unwrap();
        let old_destination = output.destination().unwrap();
        let old_generation = session.player().generation();

        session.start_session(16_000).unwrap();
        assert_eq!(output.open_contexts(), 1);
        assert_eq!(old_destination.connected_sinks(), 0);
        assert!(session.player().generation() > old_generation);
        assert_eq!(session.state(), PlayerState::Ready);

        // Pulling the released context produces nothing and no callbacks.
        let mut out = vec![1.0f32; 16];
        old_destination.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(session.player().counters().entries_finished, 0);
        assert_eq!(session.state(), PlayerState::Ready);
    }

    #[test]
    fn stop_then_enqueue_recreates_sink_lazily() {
        let output = Arc::new(OfflineOutput::new(1));
        let session = PlaybackSession::new(output.clone());
        session.start_session(16_000).unwrap();
        session.enqueue(chunk(2)).unwrap();
        session.stop();
        assert_eq!(session.state(), PlayerState::Empty);
        assert!(session.is_active());

        let id = session.enqueue(chunk(2)).unwrap();
        assert_eq!(id, BufferId(1), "fresh sink restarts its id sequence");
        assert_eq!(session.state(), PlayerState::Ready);
        session.play().unwrap();
        output.render(2);
        assert_eq!(session.state(), PlayerState::Drained);
    }

    #[test]
    fn end_session_is_idempotent_and_releases_context() {
        let output = Arc::new(OfflineOutput::new(1));
        let session = PlaybackSession::new(output.clone());
        session.end_session();
        session.start_session(16_000).unwrap();
        assert_eq!(output.open_contexts(), 1);
        session.end_session();
        session.end_session();
        assert_eq!(output.open_contexts(), 0);
        assert!(!session.is_active());
        assert_eq!(session.state(), PlayerState::Empty);
    }

    #[test]
    fn failed_start_leaves_nothing_allocated() {
        let output = Arc::new(OfflineOutput::new(1).with_max_contexts(0));
        let session = PlaybackSession::new(output.clone());
        assert!(matches!(
            session.start_session(16_000),
            Err(QueuecastError::Resource(_))
        ));
        assert!(!session.is_active());
        assert_eq!(output.open_contexts(), 0);
    }

    #[test]
    fn dropping_the_session_closes_the_context() {
        let output = Arc::new(OfflineOutput::new(1));
        {
            let session = PlaybackSession::new(output.clone());
            session.start_session(16_000).unwrap();
            assert_eq!(output.open_contexts(), 1);
        }
        assert_eq!(output.open_contexts(), 0);
    }
}
