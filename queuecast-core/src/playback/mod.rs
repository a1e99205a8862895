//! Gapless playback through a buffer-queue sink.
//!
//! ## Layers
//!
//! ```text
//! AudioOutput (factory) ──open_context──► OutputContext ──create_queue_sink──► QueueSink
//!                                              │                                  │
//!                                         destination ◄──────connect───────────────┘
//!                                              │
//!                                      render thread / cpal callback
//!                                              │
//!                                   on_entry_ended(Some(id) | None)
//!                                              │
//!                                    BufferQueuePlayer (tail-id tracking)
//!                                              │
//!                                       PlaybackSession
//! ```
//!
//! ## Sink contract
//!
//! - `enqueue_buffer` returns an id that is unique and never reused for the
//!   lifetime of that sink, and increases with every call.
//! - Entries render in enqueue order and the ended callback fires once per
//!   entry, in the same order.
//! - `None` in the ended callback means the sink itself stopped.
//! - `enqueue_buffer` and `start` never invoke the ended callback on the
//!   caller's stack. The player holds its lock across those calls.

#[cfg(feature = "audio-cpal")]
pub mod device;
pub mod offline;
pub mod player;
pub mod queue_sink;
pub mod session;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffering::chunk::AudioChunk;
use crate::error::Result;

pub use offline::{OfflineContext, OfflineOutput};
pub use player::{BufferQueuePlayer, PlayerState};
pub use queue_sink::{Destination, SoftwareQueueSink};
pub use session::PlaybackSession;

#[cfg(feature = "audio-cpal")]
pub use device::CpalOutput;

/// Identifier of one entry in a queue sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferId(pub u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fired by a sink as each entry finishes, or with `None` when the sink stops.
pub type EntryEndedCallback = Arc<dyn Fn(Option<BufferId>) + Send + Sync>;

/// Factory for output contexts (one per playback session).
pub trait AudioOutput: Send + Sync {
    /// # Errors
    /// Returns `QueuecastError::Resource` when the device cannot be opened.
    fn open_context(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>>;
}

/// One audio output context with a single destination.
pub trait OutputContext: Send {
    fn sample_rate(&self) -> u32;

    /// Destination clock in seconds.
    fn current_time(&self) -> f64;

    fn create_queue_sink(&mut self) -> Result<Box<dyn QueueSink>>;

    /// Release the context. Must tolerate being called more than once.
    fn close(&mut self) -> Result<()>;
}

/// A gapless FIFO of audio buffers feeding a context destination.
pub trait QueueSink: Send {
    fn connect(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;

    fn enqueue_buffer(&mut self, chunk: AudioChunk) -> Result<BufferId>;

    /// Begin rendering at context time `when` (seconds).
    fn start(&mut self, when: f64) -> Result<()>;

    /// Drop all pending entries and stop rendering.
    fn stop(&mut self) -> Result<()>;

    fn set_on_entry_ended(&mut self, callback: EntryEndedCallback);
}
