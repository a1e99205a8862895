//! Typed audio chunk handed from capture to the playback queue.

use crate::codec::{self, EncodedChunk};

/// An immutable block of interleaved `f32` samples.
///
/// Produced once per capture interval and moved, never shared, from the
/// capture adapter to the converter and then into the playback queue.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Interleaved samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    channels: u16,
    /// Sample rate in Hz (e.g. 16000, 44100, 48000).
    pub sample_rate: u32,
    /// Position of this chunk in its capture cycle, starting at 0.
    pub index: u64,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sample_rate,
            index: 0,
        }
    }

    /// Mono chunk shorthand.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, 1, sample_rate)
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    /// Build a chunk from PCM16 samples.
    pub fn from_pcm16(pcm: &[i16], channels: u16, sample_rate: u32) -> Self {
        Self::new(codec::pcm16_to_float(pcm), channels, sample_rate)
    }

    /// Interleaved channel count, always at least 1.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of whole frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Returns true if the chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn to_pcm16(&self) -> Vec<i16> {
        codec::float_to_pcm16(&self.samples)
    }

    /// Transport form of this chunk's samples.
    pub fn encode(&self) -> EncodedChunk {
        codec::encode_samples(&self.samples)
    }
}
