//! # queuecast-core
//!
//! Streaming PCM capture and gapless buffer-queue playback.
//!
//! ## Architecture
//!
//! ```text
//! CaptureSource ─(interval chunks)─► StreamingCapture ─► ChunkRouter
//!                                                           │
//!                                     ┌─────────────────────┼──────────────────┐
//!                                     ▼                     ▼                  ▼
//!                         codec → TransportLog    PlaybackSession    ChunkCapturedEvent
//!                                                           │
//!                                                  BufferQueuePlayer
//!                                                           │
//!                                                 QueueSink (FIFO of chunks)
//!                                                           │
//!                                         cpal output / offline destination
//! ```
//!
//! Completion is reported exactly once per playback run: when the entry last
//! enqueued finishes, not when any earlier entry does.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod capture;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;

// Convenience re-exports for downstream crates
pub use buffering::chunk::AudioChunk;
pub use capture::{CaptureConfig, CaptureSource, IntervalSource, StreamingCapture, ToneBackend};
pub use codec::{decode_samples, encode_samples, EncodedChunk};
pub use engine::{pipeline::DiagnosticsSnapshot, EngineConfig, QueuecastEngine};
pub use error::{QueuecastError, Result};
pub use ipc::events::{
    CaptureState, CaptureStatusEvent, ChunkCapturedEvent, PlaybackStatusEvent, PlayerState,
};
pub use playback::{
    AudioOutput, BufferId, BufferQueuePlayer, OfflineOutput, PlaybackSession, QueueSink,
};

#[cfg(feature = "audio-cpal")]
pub use capture::CpalBackend;

#[cfg(feature = "audio-cpal")]
pub use playback::CpalOutput;
