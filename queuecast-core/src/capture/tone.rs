//! Synthetic sine backend for demos, the offline renderer and tests.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{interval::FrameBackend, CaptureConfig};
use crate::buffering::{Producer, SampleProducer};
use crate::error::{QueuecastError, Result};

/// Generator block length.
const BLOCK_MS: u64 = 10;

/// Pushes a continuous sine tone into the capture ring.
///
/// Paced by default (one 10 ms block per 10 ms of wall time). An unpaced
/// tone with a frame limit pushes as fast as the ring accepts and then stops.
pub struct ToneBackend {
    frequency: f32,
    amplitude: f32,
    frame_limit: Option<u64>,
    paced: bool,
    stop: Arc<AtomicBool>,
    generated: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl ToneBackend {
    pub fn new(frequency: f32, amplitude: f32) -> Self {
        Self {
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            frame_limit: None,
            paced: true,
            stop: Arc::new(AtomicBool::new(false)),
            generated: Arc::new(AtomicU64::new(0)),
            thread: None,
        }
    }

    /// Stop generating after `frames` frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Frames pushed into the ring so far.
    pub fn frames_generated(&self) -> u64 {
        self.generated.load(Ordering::Acquire)
    }

    /// Shared counter of frames pushed, readable after the backend is moved
    /// into a source.
    pub fn progress(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generated)
    }

    /// True once a frame-limited tone has pushed its last frame.
    pub fn is_exhausted(&self) -> bool {
        self.frame_limit
            .is_some_and(|limit| self.frames_generated() >= limit)
    }
}

impl FrameBackend for ToneBackend {
    fn open(&mut self, config: &CaptureConfig, producer: SampleProducer) -> Result<()> {
        self.close();
        self.stop.store(false, Ordering::Release);
        self.generated.store(0, Ordering::Release);

        let generator = Generator {
            frequency: self.frequency,
            amplitude: self.amplitude,
            frame_limit: self.frame_limit,
            paced: self.paced,
            config: *config,
            stop: Arc::clone(&self.stop),
            generated: Arc::clone(&self.generated),
        };
        let handle = std::thread::Builder::new()
            .name("queuecast-tone".into())
            .spawn(move || generator.run(producer))
            .map_err(QueuecastError::Io)?;
        self.thread = Some(handle);
        debug!(frequency = self.frequency, "tone backend opened");
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("tone generator thread panicked");
            }
        }
    }
}

impl Drop for ToneBackend {
    fn drop(&mut self) {
        self.close();
    }
}

struct Generator {
    frequency: f32,
    amplitude: f32,
    frame_limit: Option<u64>,
    paced: bool,
    config: CaptureConfig,
    stop: Arc<AtomicBool>,
    generated: Arc<AtomicU64>,
}

impl Generator {
    fn run(self, mut producer: SampleProducer) {
        let rate = self.config.sample_rate;
        let channels = self.config.channels.max(1) as usize;
        let block_frames = (rate as u64 * BLOCK_MS / 1000).max(1);
        let mut block = Vec::with_capacity(block_frames as usize * channels);
        let started = Instant::now();
        let mut frame = 0u64;

        while !self.stop.load(Ordering::Acquire) {
            let frames = match self.frame_limit {
                Some(limit) if frame >= limit => break,
                Some(limit) => block_frames.min(limit - frame),
                None => block_frames,
            };
            block.resize(frames as usize * channels, 0.0);
            fill_tone(
                &mut block,
                frame,
                channels,
                rate,
                self.frequency,
                self.amplitude,
            );

            let mut written = 0;
            while written < block.len() {
                written += producer.push_slice(&block[written..]);
                if written < block.len() {
                    if self.stop.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            frame += frames;
            self.generated.store(frame, Ordering::Release);

            if self.paced {
                let due = Duration::from_secs_f64(frame as f64 / rate as f64);
                if let Some(wait) = due.checked_sub(started.elapsed()) {
                    std::thread::sleep(wait);
                }
            }
        }
    }
}

/// Fill `out` (interleaved) with a sine starting at absolute frame `start_frame`.
pub fn fill_tone(
    out: &mut [f32],
    start_frame: u64,
    channels: usize,
    sample_rate: u32,
    frequency: f32,
    amplitude: f32,
) {
    let channels = channels.max(1);
    let step = std::f64::consts::TAU * frequency as f64 / sample_rate.max(1) as f64;
    for (i, frame) in out.chunks_mut(channels).enumerate() {
        let phase = step * (start_frame + i as u64) as f64;
        let value = amplitude * phase.sin() as f32;
        frame.fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSource, ChunkHandler, IntervalSource};
    use approx::assert_abs_diff_eq;
    use parking_lot::Mutex;

    #[test]
    fn tone_is_phase_continuous_across_blocks() {
        let mut whole = vec![0.0; 64];
        fill_tone(&mut whole, 0, 1, 8_000, 440.0, 0.5);
        let mut a = vec![0.0; 32];
        let mut b = vec![0.0; 32];
        fill_tone(&mut a, 0, 1, 8_000, 440.0, 0.5);
        fill_tone(&mut b, 32, 1, 8_000, 440.0, 0.5);
        for (x, y) in whole.iter().zip(a.iter().chain(b.iter())) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
        }
        assert!(whole.iter().all(|s| s.abs() <= 0.5 + 1e-6));
    }

    #[test]
    fn channels_carry_the_same_value() {
        let mut out = vec![0.0; 8];
        fill_tone(&mut out, 3, 2, 16_000, 1_000.0, 1.0);
        for frame in out.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn limited_tone_delivers_every_frame() {
        let mut source =
            IntervalSource::new(ToneBackend::new(440.0, 0.3).with_frame_limit(2_500).unpaced());
        source.configure(&CaptureConfig::new(8_000, 125)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ChunkHandler = Arc::new(move |chunk: crate::buffering::chunk::AudioChunk| {
            sink.lock().push(chunk.frames())
        });
        source.start(handler).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !source.backend().is_exhausted() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        source.stop().unwrap();

        // 1000 frames per chunk: two full chunks and a 500-frame tail.
        assert_eq!(*seen.lock(), vec![1_000, 1_000, 500]);
    }
}
