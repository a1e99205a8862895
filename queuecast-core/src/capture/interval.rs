//! Interval chunking on top of a raw frame backend.
//!
//! A [`FrameBackend`] pushes interleaved f32 samples into the SPSC ring from
//! whatever thread it likes (a cpal callback, a generator thread). The pump
//! thread owned by [`IntervalSource`] pops them and hands the chunk handler
//! exactly `frames_per_chunk` frames at a time. On stop the backend is closed
//! first, then the pump drains the ring and delivers whatever is left as a
//! shorter final chunk.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use super::{CaptureConfig, CaptureSource, ChunkHandler};
use crate::buffering::{
    chunk::AudioChunk, create_sample_ring, Consumer, SampleConsumer, SampleProducer,
    DEFAULT_RING_CAPACITY,
};
use crate::error::{QueuecastError, Result};

/// Upper bound on how long the pump sleeps between ring polls.
const PUMP_POLL: Duration = Duration::from_millis(10);

/// Raw sample producer driven by [`IntervalSource`].
pub trait FrameBackend: Send {
    /// Check that capture is permitted before anything is opened.
    fn check_permission(&self) -> Result<()> {
        Ok(())
    }

    /// Begin pushing interleaved samples, laid out per `config`, into `producer`.
    fn open(&mut self, config: &CaptureConfig, producer: SampleProducer) -> Result<()>;

    /// Stop pushing. Every sample pushed before this returns must already be
    /// in the ring.
    fn close(&mut self);
}

/// [`CaptureSource`] that slices a backend's frames into fixed intervals.
pub struct IntervalSource<B: FrameBackend> {
    backend: B,
    config: Option<CaptureConfig>,
    ring_capacity: usize,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl<B: FrameBackend> IntervalSource<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: None,
            ring_capacity: DEFAULT_RING_CAPACITY,
            running: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_running(&self) -> bool {
        self.pump.is_some()
    }
}

impl<B: FrameBackend> CaptureSource for IntervalSource<B> {
    fn configure(&mut self, config: &CaptureConfig) -> Result<()> {
        if self.pump.is_some() {
            return Err(QueuecastError::AlreadyCapturing);
        }
        config.validate()?;
        self.backend.check_permission()?;
        self.config = Some(*config);
        Ok(())
    }

    fn start(&mut self, handler: ChunkHandler) -> Result<()> {
        if self.pump.is_some() {
            return Err(QueuecastError::AlreadyCapturing);
        }
        let Some(config) = self.config else {
            return Err(QueuecastError::InvalidState(
                "capture source is not configured".into(),
            ));
        };

        // At least a few intervals of headroom, whatever the configured capacity.
        let capacity = self.ring_capacity.max(config.samples_per_chunk() * 4);
        let (producer, consumer) = create_sample_ring(capacity);

        self.running.store(true, Ordering::Release);
        if let Err(e) = self.backend.open(&config, producer) {
            self.running.store(false, Ordering::Release);
            return Err(e);
        }

        let running = Arc::clone(&self.running);
        let spawned = std::thread::Builder::new()
            .name("queuecast-capture-pump".into())
            .spawn(move || pump(consumer, running, config, handler));
        match spawned {
            Ok(handle) => {
                self.pump = Some(handle);
                debug!(capacity, "capture pump started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                self.backend.close();
                Err(QueuecastError::Io(e))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.pump.take() else {
            return Ok(());
        };
        self.backend.close();
        self.running.store(false, Ordering::Release);
        handle
            .join()
            .map_err(|_| QueuecastError::AudioStream("capture pump panicked".into()))?;
        debug!("capture pump joined");
        Ok(())
    }
}

impl<B: FrameBackend> Drop for IntervalSource<B> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("capture source stop failed on drop: {e}");
        }
    }
}

fn pump(
    mut consumer: SampleConsumer,
    running: Arc<AtomicBool>,
    config: CaptureConfig,
    handler: ChunkHandler,
) {
    let chunk_len = config.samples_per_chunk();
    let channels = config.channels.max(1);
    let poll = PUMP_POLL.min(config.interval());
    let mut pending: Vec<f32> = Vec::with_capacity(chunk_len);
    let mut scratch = vec![0f32; chunk_len];

    loop {
        // Read the flag before draining: once it is false the backend is
        // closed, so this drain sees every sample it ever pushed.
        let stopping = !running.load(Ordering::Acquire);
        loop {
            let want = chunk_len - pending.len();
            let n = consumer.pop_slice(&mut scratch[..want]);
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&scratch[..n]);
            if pending.len() == chunk_len {
                let samples = std::mem::replace(&mut pending, Vec::with_capacity(chunk_len));
                handler(AudioChunk::new(samples, channels, config.sample_rate));
            }
        }
        if stopping {
            break;
        }
        std::thread::sleep(poll);
    }

    let whole = pending.len() - pending.len() % channels as usize;
    pending.truncate(whole);
    if !pending.is_empty() {
        debug!(frames = whole / channels as usize, "flushing capture tail");
        handler(AudioChunk::new(pending, channels, config.sample_rate));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::Producer;
    use parking_lot::Mutex;

    /// Pushes a fixed sample vector synchronously on open.
    struct BufferBackend {
        samples: Vec<f32>,
        deny: bool,
        closes: usize,
    }

    impl BufferBackend {
        fn new(samples: Vec<f32>) -> Self {
            Self {
                samples,
                deny: false,
                closes: 0,
            }
        }
    }

    impl FrameBackend for BufferBackend {
        fn check_permission(&self) -> Result<()> {
            if self.deny {
                return Err(QueuecastError::PermissionDenied("denied".into()));
            }
            Ok(())
        }

        fn open(&mut self, _config: &CaptureConfig, mut producer: SampleProducer) -> Result<()> {
            let pushed = producer.push_slice(&self.samples);
            assert_eq!(pushed, self.samples.len());
            Ok(())
        }

        fn close(&mut self) {
            self.closes += 1;
        }
    }

    fn collect() -> (ChunkHandler, Arc<Mutex<Vec<AudioChunk>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ChunkHandler = Arc::new(move |chunk| sink.lock().push(chunk));
        (handler, seen)
    }

    #[test]
    fn slices_exact_intervals_and_flushes_tail() {
        // 100 ms at 1 kHz = 100 frames per chunk; 250 frames pushed.
        let samples: Vec<f32> = (0..250).map(|i| i as f32 / 1000.0).collect();
        let mut source = IntervalSource::new(BufferBackend::new(samples.clone()));
        source.configure(&CaptureConfig::new(1_000, 100)).unwrap();
        let (handler, seen) = collect();
        source.start(handler).unwrap();
        source.stop().unwrap();

        let chunks = seen.lock();
        let frames: Vec<usize> = chunks.iter().map(AudioChunk::frames).collect();
        assert_eq!(frames, vec![100, 100, 50]);
        let joined: Vec<f32> = chunks.iter().flat_map(|c| c.samples.clone()).collect();
        assert_eq!(joined, samples, "no frames lost, duplicated or reordered");
        assert_eq!(source.backend().closes, 1);
    }

    #[test]
    fn stereo_chunks_hold_whole_frames() {
        let config = CaptureConfig {
            channels: 2,
            ..CaptureConfig::new(1_000, 10)
        };
        // 25 frames plus one stray sample.
        let mut source = IntervalSource::new(BufferBackend::new(vec![0.5; 51]));
        source.configure(&config).unwrap();
        let (handler, seen) = collect();
        source.start(handler).unwrap();
        source.stop().unwrap();

        let chunks = seen.lock();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.channels() == 2));
        assert_eq!(chunks[2].frames(), 5);
        assert_eq!(chunks[2].samples.len(), 10);
    }

    #[test]
    fn start_requires_configure() {
        let mut source = IntervalSource::new(BufferBackend::new(vec![]));
        let (handler, _) = collect();
        assert!(matches!(
            source.start(handler),
            Err(QueuecastError::InvalidState(_))
        ));
    }

    #[test]
    fn permission_is_checked_on_configure() {
        let mut backend = BufferBackend::new(vec![]);
        backend.deny = true;
        let mut source = IntervalSource::new(backend);
        assert!(matches!(
            source.configure(&CaptureConfig::default()),
            Err(QueuecastError::PermissionDenied(_))
        ));
    }

    #[test]
    fn double_start_is_rejected_and_stop_is_idempotent() {
        let mut source = IntervalSource::new(BufferBackend::new(vec![0.0; 10]));
        source.configure(&CaptureConfig::new(1_000, 100)).unwrap();
        let (handler, seen) = collect();
        source.start(Arc::clone(&handler)).unwrap();
        assert!(matches!(
            source.start(handler),
            Err(QueuecastError::AlreadyCapturing)
        ));
        source.stop().unwrap();
        source.stop().unwrap();
        assert!(!source.is_running());
        assert_eq!(source.backend().closes, 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn nothing_captured_means_no_tail_chunk() {
        let mut source = IntervalSource::new(BufferBackend::new(vec![]));
        source.configure(&CaptureConfig::new(1_000, 100)).unwrap();
        let (handler, seen) = collect();
        source.start(handler).unwrap();
        source.stop().unwrap();
        assert!(seen.lock().is_empty());
    }
}
