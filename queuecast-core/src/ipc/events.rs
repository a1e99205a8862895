//! Event types broadcast to UI bindings.
//!
//! | Event | Emitted by |
//! |-------|------------|
//! | `PlaybackStatusEvent` | `BufferQueuePlayer` on confirmed start and on true drain |
//! | `CaptureStatusEvent` | `StreamingCapture` on start/stop |
//! | `ChunkCapturedEvent` | `QueuecastEngine` for every captured chunk |

use serde::{Deserialize, Serialize};

use crate::playback::BufferId;

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Lifecycle of the buffer queue player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    /// No sink, no pending entries.
    Empty,
    /// Sink exists and accepts entries; not started.
    Ready,
    /// Sink started and draining its FIFO.
    Playing,
    /// Sink started and the last known entry has finished.
    Drained,
}

impl PlayerState {
    /// The caller-visible "is playing" flag.
    pub fn is_playing(self) -> bool {
        matches!(self, PlayerState::Playing)
    }
}

/// Emitted when the player's `is_playing` flag changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatusEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub is_playing: bool,
    pub state: PlayerState,
    /// Sink generation the event belongs to.
    pub generation: u64,
    /// Tail entry whose completion ended playback, if any.
    pub buffer_id: Option<BufferId>,
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Lifecycle of the capture side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Idle,
    Capturing,
    /// Stop requested; buffered frames are still being delivered.
    Flushing,
}

/// Emitted when capture starts or stops streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatusEvent {
    pub is_streaming: bool,
    pub state: CaptureState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Emitted for every chunk delivered by capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkCapturedEvent {
    /// Arrival index within the capture cycle.
    pub index: u64,
    pub frames: usize,
    pub duration_ms: f64,
    /// Id the chunk received in the playback queue, if it was enqueued.
    pub buffer_id: Option<BufferId>,
}
