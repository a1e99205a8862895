//! Streaming capture: fixed-interval audio chunks delivered to a handler.
//!
//! # Contract
//!
//! A [`CaptureSource`] configured with a sample rate and interval delivers one
//! chunk of about `sample_rate * interval_ms / 1000` frames roughly every
//! `interval_ms`, in strictly increasing time order, with no frames lost or
//! duplicated under normal operation. How it gets there (ring buffer, device
//! callback, polling loop) is up to the source.
//!
//! [`StreamingCapture`] wraps a source with the `Idle → Capturing → Flushing
//! → Idle` lifecycle, stamps arrival indices, and broadcasts status events.

#[cfg(feature = "audio-cpal")]
pub mod device;
pub mod interval;
pub mod tone;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::buffering::chunk::AudioChunk;
use crate::error::{QueuecastError, Result};
use crate::ipc::events::CaptureStatusEvent;

pub use crate::ipc::events::CaptureState;
pub use interval::{FrameBackend, IntervalSource};
pub use tone::ToneBackend;

#[cfg(feature = "audio-cpal")]
pub use device::CpalBackend;

const STATUS_CHANNEL_CAP: usize = 32;

/// Receives every captured chunk, on the source's delivery thread.
pub type ChunkHandler = Arc<dyn Fn(AudioChunk) + Send + Sync>;

/// Capture parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CaptureConfig {
    /// Target sample rate in Hz.
    pub sample_rate: u32,
    /// Chunk duration in milliseconds.
    pub interval_ms: u32,
    /// Interleaved channel count.
    pub channels: u16,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            interval_ms: 100,
            channels: 1,
        }
    }
}

impl CaptureConfig {
    pub fn new(sample_rate: u32, interval_ms: u32) -> Self {
        Self {
            sample_rate,
            interval_ms,
            channels: 1,
        }
    }

    /// # Errors
    /// `QueuecastError::InvalidConfig` for a zero rate, interval or channel count.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(QueuecastError::InvalidConfig("sample rate is 0".into()));
        }
        if self.interval_ms == 0 {
            return Err(QueuecastError::InvalidConfig("interval is 0 ms".into()));
        }
        if self.channels == 0 {
            return Err(QueuecastError::InvalidConfig("channel count is 0".into()));
        }
        Ok(())
    }

    /// Frames in one full chunk (at least 1).
    pub fn frames_per_chunk(&self) -> usize {
        ((self.sample_rate as u64 * self.interval_ms as u64) / 1000).max(1) as usize
    }

    /// Interleaved samples in one full chunk.
    pub fn samples_per_chunk(&self) -> usize {
        self.frames_per_chunk() * self.channels.max(1) as usize
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms as u64)
    }
}

/// The capture facility consumed by [`StreamingCapture`].
pub trait CaptureSource: Send {
    /// Apply `config`. Platform permission refusals surface here as
    /// `QueuecastError::PermissionDenied`.
    fn configure(&mut self, config: &CaptureConfig) -> Result<()>;

    /// Begin delivering chunks to `handler`.
    fn start(&mut self, handler: ChunkHandler) -> Result<()>;

    /// Stop delivering. Audio already captured is delivered before this
    /// returns. Must be idempotent.
    fn stop(&mut self) -> Result<()>;
}

/// Lifecycle wrapper around a [`CaptureSource`].
pub struct StreamingCapture<S: CaptureSource> {
    source: Mutex<S>,
    config: CaptureConfig,
    state: Mutex<CaptureState>,
    handler: Mutex<Option<ChunkHandler>>,
    /// Set by `prepare`, consumed by the next `start`.
    prepared: AtomicBool,
    next_index: Arc<AtomicU64>,
    status_tx: broadcast::Sender<CaptureStatusEvent>,
}

impl<S: CaptureSource> StreamingCapture<S> {
    pub fn new(source: S, config: CaptureConfig) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAP);
        Self {
            source: Mutex::new(source),
            config,
            state: Mutex::new(CaptureState::Idle),
            handler: Mutex::new(None),
            prepared: AtomicBool::new(false),
            next_index: Arc::new(AtomicU64::new(0)),
            status_tx,
        }
    }

    /// Register the chunk handler used by the next `start`.
    pub fn on_chunk_ready<F>(&self, handler: F)
    where
        F: Fn(AudioChunk) + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// Validate the config and configure the source without streaming.
    ///
    /// Permission refusals surface here, so callers can fail before they
    /// allocate anything else for the cycle. The next `start` skips the
    /// configure step.
    ///
    /// # Errors
    /// - `QueuecastError::AlreadyCapturing` unless idle.
    /// - Whatever the source reports from `configure`. The adapter stays idle.
    pub fn prepare(&self) -> Result<()> {
        let state = self.state.lock();
        if *state != CaptureState::Idle {
            return Err(QueuecastError::AlreadyCapturing);
        }
        self.configure_source()?;
        self.prepared.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Configure the source (unless `prepare` already did) and begin streaming.
    ///
    /// # Errors
    /// - `QueuecastError::AlreadyCapturing` unless idle.
    /// - `QueuecastError::InvalidState` when no handler is registered.
    /// - Whatever the source reports from `configure`/`start`
    ///   (e.g. `PermissionDenied`). The adapter stays idle in that case.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != CaptureState::Idle {
            return Err(QueuecastError::AlreadyCapturing);
        }
        let Some(handler) = self.handler.lock().clone() else {
            return Err(QueuecastError::InvalidState(
                "no chunk handler registered".into(),
            ));
        };
        if !self.prepared.swap(false, Ordering::SeqCst) {
            self.configure_source()?;
        }

        self.next_index.store(0, Ordering::SeqCst);
        let next_index = Arc::clone(&self.next_index);
        let stamped: ChunkHandler = Arc::new(move |chunk: AudioChunk| {
            let index = next_index.fetch_add(1, Ordering::SeqCst);
            handler(chunk.with_index(index));
        });

        if let Err(e) = self.source.lock().start(stamped) {
            warn!("capture failed to start: {e}");
            self.emit(CaptureState::Idle, Some(e.to_string()));
            return Err(e);
        }

        *state = CaptureState::Capturing;
        self.emit(CaptureState::Capturing, None);
        info!(
            sample_rate = self.config.sample_rate,
            interval_ms = self.config.interval_ms,
            frames_per_chunk = self.config.frames_per_chunk(),
            "capture started"
        );
        Ok(())
    }

    /// Stop streaming, flushing buffered audio first. No-op when idle.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != CaptureState::Capturing {
                return Ok(());
            }
            *state = CaptureState::Flushing;
        }
        self.emit(CaptureState::Flushing, None);

        let result = self.source.lock().stop();

        *self.state.lock() = CaptureState::Idle;
        let detail = result.as_ref().err().map(|e| e.to_string());
        self.emit(CaptureState::Idle, detail);
        info!(
            chunks = self.next_index.load(Ordering::SeqCst),
            "capture stopped"
        );
        result
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    pub fn is_capturing(&self) -> bool {
        self.state() != CaptureState::Idle
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Chunks delivered in the current (or last) capture cycle.
    pub fn chunks_delivered(&self) -> u64 {
        self.next_index.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureStatusEvent> {
        self.status_tx.subscribe()
    }

    fn configure_source(&self) -> Result<()> {
        self.config.validate()?;
        if let Err(e) = self.source.lock().configure(&self.config) {
            warn!("capture source refused configuration: {e}");
            self.emit(CaptureState::Idle, Some(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    fn emit(&self, state: CaptureState, detail: Option<String>) {
        let _ = self.status_tx.send(CaptureStatusEvent {
            is_streaming: state != CaptureState::Idle,
            state,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Source that delivers a fixed set of chunks synchronously on start.
    struct ScriptedSource {
        chunks: Vec<AudioChunk>,
        deny: bool,
        stops: Arc<AtomicU64>,
    }

    impl CaptureSource for ScriptedSource {
        fn configure(&mut self, _config: &CaptureConfig) -> Result<()> {
            if self.deny {
                return Err(QueuecastError::PermissionDenied(
                    "microphone access refused".into(),
                ));
            }
            Ok(())
        }

        fn start(&mut self, handler: ChunkHandler) -> Result<()> {
            for chunk in self.chunks.drain(..) {
                handler(chunk);
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn source(n: usize, deny: bool) -> (ScriptedSource, Arc<AtomicU64>) {
        let stops = Arc::new(AtomicU64::new(0));
        let chunks = (0..n)
            .map(|_| AudioChunk::mono(vec![0.0; 160], 16_000))
            .collect();
        (
            ScriptedSource {
                chunks,
                deny,
                stops: Arc::clone(&stops),
            },
            stops,
        )
    }

    #[test]
    fn frames_per_chunk_follows_rate_and_interval() {
        assert_eq!(CaptureConfig::new(16_000, 100).frames_per_chunk(), 1_600);
        assert_eq!(CaptureConfig::new(44_100, 1_000).frames_per_chunk(), 44_100);
        assert_eq!(CaptureConfig::new(8_000, 0).frames_per_chunk(), 1);
        let stereo = CaptureConfig {
            channels: 2,
            ..CaptureConfig::new(48_000, 10)
        };
        assert_eq!(stereo.samples_per_chunk(), 960);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(CaptureConfig::new(0, 100).validate().is_err());
        assert!(CaptureConfig::new(16_000, 0).validate().is_err());
        let no_channels = CaptureConfig {
            channels: 0,
            ..CaptureConfig::default()
        };
        assert!(matches!(
            no_channels.validate(),
            Err(QueuecastError::InvalidConfig(_))
        ));
    }

    #[test]
    fn chunks_are_stamped_with_arrival_index() {
        let (src, _) = source(3, false);
        let capture = StreamingCapture::new(src, CaptureConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        capture.on_chunk_ready(move |chunk| sink.lock().push(chunk.index));
        capture.start().unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(capture.chunks_delivered(), 3);
    }

    #[test]
    fn double_start_fails_and_stop_is_idempotent() {
        let (src, stops) = source(0, false);
        let capture = StreamingCapture::new(src, CaptureConfig::default());
        capture.on_chunk_ready(|_| {});
        capture.stop().unwrap();
        capture.start().unwrap();
        assert!(matches!(
            capture.start(),
            Err(QueuecastError::AlreadyCapturing)
        ));
        capture.stop().unwrap();
        capture.stop().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(capture.state(), CaptureState::Idle);
    }

    #[test]
    fn permission_denial_surfaces_and_stays_idle() {
        let (src, _) = source(1, true);
        let capture = StreamingCapture::new(src, CaptureConfig::default());
        let mut rx = capture.subscribe();
        capture.on_chunk_ready(|_| {});
        let err = capture.start().unwrap_err();
        assert!(matches!(err, QueuecastError::PermissionDenied(_)));
        assert_eq!(capture.state(), CaptureState::Idle);
        let event = rx.try_recv().unwrap();
        assert!(!event.is_streaming);
        assert!(event.detail.unwrap().contains("refused"));
    }

    #[test]
    fn prepare_surfaces_denial_and_start_skips_reconfigure() {
        let (src, _) = source(0, true);
        let capture = StreamingCapture::new(src, CaptureConfig::default());
        capture.on_chunk_ready(|_| {});
        assert!(matches!(
            capture.prepare(),
            Err(QueuecastError::PermissionDenied(_))
        ));
        assert_eq!(capture.state(), CaptureState::Idle);

        let (src, _) = source(2, false);
        let capture = StreamingCapture::new(src, CaptureConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        capture.on_chunk_ready(move |chunk| sink.lock().push(chunk.index));
        capture.prepare().unwrap();
        capture.source.lock().deny = true;
        capture.start().unwrap();
        assert_eq!(*seen.lock(), vec![0, 1]);
    }

    #[test]
    fn start_without_handler_fails() {
        let (src, _) = source(0, false);
        let capture = StreamingCapture::new(src, CaptureConfig::default());
        assert!(matches!(
            capture.start(),
            Err(QueuecastError::InvalidState(_))
        ));
    }

    #[test]
    fn status_events_trace_the_lifecycle() {
        let (src, _) = source(0, false);
        let capture = StreamingCapture::new(src, CaptureConfig::default());
        let mut rx = capture.subscribe();
        capture.on_chunk_ready(|_| {});
        capture.start().unwrap();
        capture.stop().unwrap();
        let states: Vec<CaptureState> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.state)
            .collect();
        assert_eq!(
            states,
            vec![
                CaptureState::Capturing,
                CaptureState::Flushing,
                CaptureState::Idle
            ]
        );
    }
}
