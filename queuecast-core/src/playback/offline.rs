//! Offline output: contexts whose destination is pulled by the caller instead
//! of an audio device. Used for rendering to WAV and for deterministic tests.

use std::path::Path;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{AudioOutput, Destination, OutputContext, QueueSink, SoftwareQueueSink};
use crate::error::{QueuecastError, Result};

/// Factory for [`OfflineContext`]s.
pub struct OfflineOutput {
    channels: u16,
    max_contexts: Option<usize>,
    open_contexts: Arc<AtomicUsize>,
    latest: Mutex<Option<Destination>>,
}

impl OfflineOutput {
    pub fn new(channels: u16) -> Self {
        Self {
            channels: channels.max(1),
            max_contexts: None,
            open_contexts: Arc::new(AtomicUsize::new(0)),
            latest: Mutex::new(None),
        }
    }

    /// Refuse to open more than `max` simultaneously open contexts.
    pub fn with_max_contexts(mut self, max: usize) -> Self {
        self.max_contexts = Some(max);
        self
    }

    /// Contexts opened and not yet closed.
    pub fn open_contexts(&self) -> usize {
        self.open_contexts.load(Ordering::Acquire)
    }

    /// Destination of the most recently opened context.
    pub fn destination(&self) -> Option<Destination> {
        self.latest.lock().clone()
    }

    /// Pull `frames` frames from the most recent context.
    ///
    /// Returns an empty buffer when no context was ever opened.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let Some(dest) = self.destination() else {
            return Vec::new();
        };
        let mut out = vec![0.0; frames * dest.channels() as usize];
        dest.render(&mut out);
        out
    }
}

impl AudioOutput for OfflineOutput {
    fn open_context(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>> {
        if sample_rate == 0 {
            return Err(QueuecastError::Resource(
                "cannot open an output context at 0 Hz".into(),
            ));
        }
        let open = self.open_contexts.fetch_add(1, Ordering::AcqRel);
        if let Some(max) = self.max_contexts {
            if open >= max {
                self.open_contexts.fetch_sub(1, Ordering::AcqRel);
                return Err(QueuecastError::Resource(format!(
                    "offline output limited to {max} open context(s)"
                )));
            }
        }
        let destination = Destination::new(sample_rate, self.channels);
        *self.latest.lock() = Some(destination.clone());
        debug!(sample_rate, channels = self.channels, "offline context opened");
        Ok(Box::new(OfflineContext {
            destination,
            open_contexts: Arc::clone(&self.open_contexts),
            closed: false,
        }))
    }
}

/// Output context rendered on demand.
pub struct OfflineContext {
    destination: Destination,
    open_contexts: Arc<AtomicUsize>,
    closed: bool,
}

impl OfflineContext {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

impl OutputContext for OfflineContext {
    fn sample_rate(&self) -> u32 {
        self.destination.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.destination.current_time()
    }

    fn create_queue_sink(&mut self) -> Result<Box<dyn QueueSink>> {
        if self.closed {
            return Err(QueuecastError::Resource("output context is closed".into()));
        }
        Ok(Box::new(SoftwareQueueSink::new(self.destination.clone())))
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.destination.close();
            self.open_contexts.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

impl Drop for OfflineContext {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Write interleaved samples to a 16-bit PCM WAV file.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32, channels: u16) -> Result<()> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| anyhow::anyhow!("wav create: {e}"))?;
    for s in crate::codec::float_to_pcm16(samples) {
        writer
            .write_sample(s)
            .map_err(|e| anyhow::anyhow!("wav write: {e}"))?;
    }
    writer
        .finalize()
        .map_err(|e| anyhow::anyhow!("wav finalize: {e}"))?;
    info!(path = %path.display(), frames = samples.len() / channels.max(1) as usize, "wav written");
    Ok(())
}
