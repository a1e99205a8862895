//! Software buffer-queue sink and the destination bus it renders into.
//!
//! `Destination::render` is the only place audio is produced. It is called
//! from whatever drives the context: the cpal output callback, or a caller
//! pulling frames from an offline context. Ended callbacks are collected while
//! sink locks are held and invoked only after every lock is released, so a
//! callback may freely call back into the player.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{BufferId, EntryEndedCallback, QueueSink};
use crate::buffering::chunk::AudioChunk;
use crate::error::{QueuecastError, Result};

type Notification = (EntryEndedCallback, Option<BufferId>);

/// Mixing bus shared between an output context and its sinks.
#[derive(Clone)]
pub struct Destination {
    inner: Arc<DestinationInner>,
}

struct DestinationInner {
    sample_rate: u32,
    channels: u16,
    sinks: Mutex<Vec<Arc<SinkShared>>>,
    /// Render-time copy of `sinks`, reused so the audio callback does not allocate.
    scratch: Mutex<Vec<Arc<SinkShared>>>,
    /// Frames rendered since creation.
    position: AtomicU64,
}

impl Destination {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            inner: Arc::new(DestinationInner {
                sample_rate,
                channels: channels.max(1),
                sinks: Mutex::new(Vec::new()),
                scratch: Mutex::new(Vec::new()),
                position: AtomicU64::new(0),
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.inner.channels
    }

    pub fn position_frames(&self) -> u64 {
        self.inner.position.load(Ordering::Acquire)
    }

    pub fn current_time(&self) -> f64 {
        if self.inner.sample_rate == 0 {
            return 0.0;
        }
        self.position_frames() as f64 / self.inner.sample_rate as f64
    }

    /// Number of sinks currently connected.
    pub fn connected_sinks(&self) -> usize {
        self.inner.sinks.lock().len()
    }

    /// Fill `out` (interleaved, `channels()` wide) with the mix of every
    /// connected sink, advance the clock, then fire ended callbacks.
    ///
    /// Returns the number of frames rendered.
    pub fn render(&self, out: &mut [f32]) -> usize {
        out.fill(0.0);
        let channels = self.inner.channels as usize;
        let frames = out.len() / channels;
        let out = &mut out[..frames * channels];

        let position = self.inner.position.load(Ordering::Acquire);
        let mut notifications: Vec<Notification> = Vec::new();
        {
            // Snapshot the list so sink locks are never taken under the list lock.
            let mut sinks = self.inner.scratch.lock();
            sinks.extend(self.inner.sinks.lock().iter().cloned());
            for sink in sinks.iter() {
                sink.render_into(out, channels, position, &mut notifications);
            }
            sinks.clear();
        }
        self.inner
            .position
            .fetch_add(frames as u64, Ordering::AcqRel);

        for (callback, id) in notifications {
            callback(id);
        }
        frames
    }

    /// Detach every sink. Further renders produce silence.
    pub fn close(&self) {
        self.inner.sinks.lock().clear();
    }

    fn attach(&self, sink: &Arc<SinkShared>) {
        let mut sinks = self.inner.sinks.lock();
        if !sinks.iter().any(|s| Arc::ptr_eq(s, sink)) {
            sinks.push(Arc::clone(sink));
        }
    }

    fn detach(&self, sink: &Arc<SinkShared>) -> bool {
        let mut sinks = self.inner.sinks.lock();
        let before = sinks.len();
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
        sinks.len() != before
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("sample_rate", &self.inner.sample_rate)
            .field("channels", &self.inner.channels)
            .field("position", &self.position_frames())
            .finish_non_exhaustive()
    }
}

struct Entry {
    id: BufferId,
    chunk: AudioChunk,
    /// Frames already rendered.
    cursor: usize,
}

#[derive(Default)]
struct SinkState {
    entries: VecDeque<Entry>,
    next_id: u64,
    started: bool,
    start_frame: u64,
    stopped: bool,
    stop_notified: bool,
    on_ended: Option<EntryEndedCallback>,
}

struct SinkShared {
    state: Mutex<SinkState>,
}

impl SinkShared {
    fn render_into(
        &self,
        out: &mut [f32],
        out_channels: usize,
        position: u64,
        notifications: &mut Vec<Notification>,
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.stopped {
            if state.started && !state.stop_notified {
                state.stop_notified = true;
                if let Some(cb) = &state.on_ended {
                    notifications.push((Arc::clone(cb), None));
                }
            }
            return;
        }
        if !state.started {
            return;
        }

        let frames = out.len() / out_channels;
        let mut frame = state
            .start_frame
            .saturating_sub(position)
            .min(frames as u64) as usize;

        while let Some(front) = state.entries.front_mut() {
            let total = front.chunk.frames();
            if front.cursor >= total {
                let id = front.id;
                state.entries.pop_front();
                if let Some(cb) = &state.on_ended {
                    notifications.push((Arc::clone(cb), Some(id)));
                }
                continue;
            }
            if frame >= frames {
                break;
            }
            let n = (total - front.cursor).min(frames - frame);
            mix_frames(
                &front.chunk,
                front.cursor,
                n,
                &mut out[frame * out_channels..(frame + n) * out_channels],
                out_channels,
            );
            front.cursor += n;
            frame += n;
        }
    }
}

/// Add `n` frames of `chunk` starting at `start` into `out`, adapting the
/// channel layout: mono is duplicated, wider input is averaged into a mono
/// output, other layouts wrap channel indices.
fn mix_frames(chunk: &AudioChunk, start: usize, n: usize, out: &mut [f32], out_channels: usize) {
    let in_channels = chunk.channels() as usize;
    for f in 0..n {
        let base = (start + f) * in_channels;
        let src = &chunk.samples[base..base + in_channels];
        let dst = &mut out[f * out_channels..(f + 1) * out_channels];
        if out_channels == 1 && in_channels > 1 {
            dst[0] += src.iter().sum::<f32>() / in_channels as f32;
        } else {
            for (c, d) in dst.iter_mut().enumerate() {
                *d += src[c % in_channels];
            }
        }
    }
}

/// Queue sink rendering into a [`Destination`].
pub struct SoftwareQueueSink {
    shared: Arc<SinkShared>,
    destination: Destination,
    connected: bool,
}

impl SoftwareQueueSink {
    pub fn new(destination: Destination) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                state: Mutex::new(SinkState {
                    next_id: 1,
                    ..SinkState::default()
                }),
            }),
            destination,
            connected: false,
        }
    }

    /// Entries not yet fully rendered.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().entries.len()
    }
}

impl QueueSink for SoftwareQueueSink {
    fn connect(&mut self) -> Result<()> {
        if !self.connected {
            self.destination.attach(&self.shared);
            self.connected = true;
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Err(QueuecastError::InvalidState(
                "queue sink is not connected".into(),
            ));
        }
        self.connected = false;
        if !self.destination.detach(&self.shared) {
            warn!("queue sink was already detached from its destination");
        }
        Ok(())
    }

    fn enqueue_buffer(&mut self, chunk: AudioChunk) -> Result<BufferId> {
        if chunk.sample_rate != self.destination.sample_rate() && chunk.sample_rate != 0 {
            warn!(
                chunk_rate = chunk.sample_rate,
                context_rate = self.destination.sample_rate(),
                "enqueued chunk sample rate differs from context; playing unresampled"
            );
        }
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(QueuecastError::InvalidState("queue sink is stopped".into()));
        }
        let id = BufferId(state.next_id);
        state.next_id += 1;
        debug!(%id, frames = chunk.frames(), "buffer enqueued");
        state.entries.push_back(Entry {
            id,
            chunk,
            cursor: 0,
        });
        Ok(id)
    }

    fn start(&mut self, when: f64) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(QueuecastError::InvalidState("queue sink is stopped".into()));
        }
        if state.started {
            return Ok(());
        }
        state.started = true;
        state.start_frame = (when.max(0.0) * self.destination.sample_rate() as f64) as u64;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(QueuecastError::InvalidState(
                "queue sink already stopped".into(),
            ));
        }
        state.stopped = true;
        state.entries.clear();
        Ok(())
    }

    fn set_on_entry_ended(&mut self, callback: EntryEndedCallback) {
        self.shared.state.lock().on_ended = Some(callback);
    }
}

impl Drop for SoftwareQueueSink {
    fn drop(&mut self) {
        if self.connected {
            self.destination.detach(&self.shared);
        }
    }
}
