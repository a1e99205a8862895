//! `QueuecastEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! QueuecastEngine::new(config, source, output)
//!     └─► start_capture()   → fresh playback session, then capture; chunks stream into the queue
//!         ├─► play()        → queue starts draining (may be called before or after chunks arrive)
//!         ├─► stop_capture()→ tail flushed into the queue, session kept
//!         ├─► recording()   → merged transport text of the cycle
//!         └─► shutdown()    → capture stopped, session ended (idempotent, also on Drop)
//! ```
//!
//! `play_encoded()` plays a previously recorded transport chunk in a fresh
//! session, outside any capture cycle.

pub mod pipeline;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    buffering::{chunk::AudioChunk, merge::TransportLog},
    capture::{CaptureConfig, CaptureSource, CaptureState, StreamingCapture},
    codec::{decode_samples, EncodedChunk},
    error::{QueuecastError, Result},
    ipc::events::{CaptureStatusEvent, ChunkCapturedEvent, PlaybackStatusEvent},
    playback::{AudioOutput, BufferId, PlaybackSession, PlayerState},
};
use pipeline::{ChunkRouter, DiagnosticsSnapshot, PipelineDiagnostics};

/// Broadcast channel capacity for chunk events.
const BROADCAST_CAP: usize = 256;

/// Configuration for `QueuecastEngine`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct EngineConfig {
    /// Capture and playback sample rate (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Capture chunk length in milliseconds. Default: 1000.
    pub interval_ms: u32,
    /// Interleaved channel count. Default: 1.
    pub channels: u16,
    /// Keep every captured chunk's transport text for `recording()`.
    pub record_transport: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            interval_ms: 1_000,
            channels: 1,
            record_transport: true,
        }
    }
}

impl EngineConfig {
    /// Clamp every field into its supported range.
    pub fn normalize(&mut self) {
        self.sample_rate = self.sample_rate.clamp(8_000, 192_000);
        self.interval_ms = self.interval_ms.clamp(10, 10_000);
        self.channels = self.channels.clamp(1, 8);
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Parse a JSON config, filling missing fields with defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| QueuecastError::InvalidConfig(e.to_string()))?;
        Ok(config.normalized())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.sample_rate,
            interval_ms: self.interval_ms,
            channels: self.channels,
        }
    }
}

/// The top-level engine handle.
///
/// `QueuecastEngine` is `Send + Sync` when its source is. Wrap it in an `Arc`
/// to share between a UI layer and event-forwarding tasks.
pub struct QueuecastEngine<S: CaptureSource> {
    config: EngineConfig,
    capture: StreamingCapture<S>,
    session: Arc<PlaybackSession>,
    transport: Arc<TransportLog>,
    diagnostics: Arc<PipelineDiagnostics>,
    chunk_tx: broadcast::Sender<ChunkCapturedEvent>,
    /// Serializes calls that replace or release the playback session.
    lifecycle: Mutex<()>,
}

impl<S: CaptureSource> QueuecastEngine<S> {
    pub fn new(config: EngineConfig, source: S, output: Arc<dyn AudioOutput>) -> Self {
        let config = config.normalized();
        let (chunk_tx, _) = broadcast::channel(BROADCAST_CAP);
        let session = Arc::new(PlaybackSession::new(output));
        let transport = Arc::new(TransportLog::new());
        let diagnostics = Arc::new(PipelineDiagnostics::default());

        let capture = StreamingCapture::new(source, config.capture_config());
        let router = ChunkRouter {
            session: Arc::clone(&session),
            transport: Arc::clone(&transport),
            diagnostics: Arc::clone(&diagnostics),
            chunk_tx: chunk_tx.clone(),
            record_transport: config.record_transport,
        };
        capture.on_chunk_ready(move |chunk| router.route(chunk));

        Self {
            config,
            capture,
            session,
            transport,
            diagnostics,
            chunk_tx,
            lifecycle: Mutex::new(()),
        }
    }

    /// Start a fresh playback session and begin capturing into it.
    ///
    /// The source is configured first, so a permission refusal is returned
    /// before any playback state is touched.
    ///
    /// # Errors
    /// - `QueuecastError::AlreadyCapturing` if a capture cycle is running.
    /// - Capture preflight errors (`PermissionDenied`, `InvalidConfig`, ...).
    /// - `QueuecastError::Resource` if the output cannot be opened.
    /// - Capture start errors (`AudioStream`, ...). The new session is ended
    ///   again in that case.
    pub fn start_capture(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        self.capture.prepare()?;
        self.diagnostics.reset();
        self.transport.clear();
        self.session.start_session(self.config.sample_rate)?;

        if let Err(e) = self.capture.start() {
            self.session.end_session();
            return Err(e);
        }
        info!(
            sample_rate = self.config.sample_rate,
            interval_ms = self.config.interval_ms,
            "engine capturing"
        );
        Ok(())
    }

    /// Stop capturing. Buffered audio is flushed into the queue first.
    pub fn stop_capture(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        self.capture.stop()
    }

    /// Start draining the playback queue.
    pub fn play(&self) -> Result<()> {
        self.session.play()
    }

    /// Discard queued audio. The session stays open for further chunks.
    pub fn stop_playback(&self) {
        self.session.stop();
    }

    /// Stop capture and release every playback resource. Never fails.
    pub fn shutdown(&self) {
        let _guard = self.lifecycle.lock();
        if let Err(e) = self.capture.stop() {
            warn!("capture stop failed during shutdown: {e}");
        }
        self.session.end_session();
    }

    /// Merged transport text of every chunk captured this cycle.
    ///
    /// # Errors
    /// `QueuecastError::InvalidState` when transport recording is disabled.
    pub fn recording(&self) -> Result<EncodedChunk> {
        if !self.config.record_transport {
            return Err(QueuecastError::InvalidState(
                "transport recording is disabled".into(),
            ));
        }
        self.transport.merged()
    }

    /// Decode `chunk` and play it in a fresh session.
    ///
    /// The chunk is decoded before any playback state is touched, so a
    /// malformed chunk leaves current playback alone.
    ///
    /// # Errors
    /// - `QueuecastError::InvalidState` while capturing.
    /// - Decode errors for malformed transport text.
    pub fn play_encoded(&self, chunk: &EncodedChunk) -> Result<BufferId> {
        let _guard = self.lifecycle.lock();
        if self.capture.is_capturing() {
            return Err(QueuecastError::InvalidState(
                "cannot play a recording while capturing".into(),
            ));
        }
        let samples = decode_samples(chunk)?;
        let audio = AudioChunk::new(samples, self.config.channels, self.config.sample_rate);
        let frames = audio.frames();

        self.session.start_session(self.config.sample_rate)?;
        let id = self.session.enqueue(audio)?;
        self.session.play()?;
        info!(frames, "playing encoded chunk");
        Ok(id)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    pub fn player_state(&self) -> PlayerState {
        self.session.state()
    }

    pub fn is_playing(&self) -> bool {
        self.session.is_playing()
    }

    /// Subscribe to playback start/drain events.
    pub fn subscribe_playback(&self) -> broadcast::Receiver<PlaybackStatusEvent> {
        self.session.subscribe()
    }

    /// Subscribe to capture lifecycle events.
    pub fn subscribe_capture(&self) -> broadcast::Receiver<CaptureStatusEvent> {
        self.capture.subscribe()
    }

    /// Subscribe to per-chunk capture events.
    pub fn subscribe_chunks(&self) -> broadcast::Receiver<ChunkCapturedEvent> {
        self.chunk_tx.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot(self.session.player().counters())
    }
}

impl<S: CaptureSource> Drop for QueuecastEngine<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
