//! `BufferQueuePlayer`: the stateful core of the playback side.
//!
//! ## States
//!
//! ```text
//! Empty ──create_sink──► Ready ──start──► Playing ──tail finished──► Drained
//!   ▲                      │                 ▲                         │
//!   └──reset / teardown────┴─────────────────┴──────enqueue────────────┘
//! ```
//!
//! ## Completion rule
//!
//! The sink reports every finished entry. Only the entry whose id equals the
//! id most recently returned by `enqueue` ends playback; intermediate entries
//! finishing do not. Enqueueing while playing moves the tail forward, so
//! completion always converges on the true end of the queue.
//!
//! ## Locking
//!
//! `enqueue` (producer) and the ended callback (audio thread) both touch the
//! tail id, so both run under the same `parking_lot::Mutex`. Sink calls that
//! might re-enter the player (`stop`, `disconnect`) are made after the lock is
//! released. Each sink gets a generation number; callbacks carrying an older
//! generation are discarded.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{AudioOutput, BufferId, EntryEndedCallback, OutputContext, QueueSink};
use crate::buffering::chunk::AudioChunk;
use crate::error::{QueuecastError, Result};
use crate::ipc::events::PlaybackStatusEvent;

pub use crate::ipc::events::PlayerState;

/// Broadcast capacity for status events.
const STATUS_CHANNEL_CAP: usize = 64;

/// Counters shared with the ended callback.
#[derive(Debug, Default)]
pub struct PlayerCounters {
    pub entries_enqueued: AtomicUsize,
    pub entries_finished: AtomicUsize,
    pub drains: AtomicUsize,
    pub stale_events: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerCountersSnapshot {
    pub entries_enqueued: usize,
    pub entries_finished: usize,
    pub drains: usize,
    pub stale_events: usize,
}

impl PlayerCounters {
    pub fn snapshot(&self) -> PlayerCountersSnapshot {
        PlayerCountersSnapshot {
            entries_enqueued: self.entries_enqueued.load(Ordering::Relaxed),
            entries_finished: self.entries_finished.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            stale_events: self.stale_events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct Notifier {
    tx: broadcast::Sender<PlaybackStatusEvent>,
    seq: Arc<AtomicU64>,
}

impl Notifier {
    fn emit(&self, state: PlayerState, generation: u64, buffer_id: Option<BufferId>) {
        let _ = self.tx.send(PlaybackStatusEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            is_playing: state.is_playing(),
            state,
            generation,
            buffer_id,
        });
    }
}

struct PlayerInner {
    state: PlayerState,
    context: Option<Box<dyn OutputContext>>,
    sink: Option<Box<dyn QueueSink>>,
    /// Generation of the live sink. Bumped whenever a sink is created or released.
    generation: u64,
    /// Id most recently returned by `enqueue`.
    last_id: Option<BufferId>,
    /// Entries not yet reported finished, with their frame counts.
    pending: VecDeque<(BufferId, usize)>,
}

impl PlayerInner {
    /// Detach the live sink so it can be released outside the lock.
    fn take_sink(&mut self) -> Option<Box<dyn QueueSink>> {
        self.generation += 1;
        self.pending.clear();
        self.last_id = None;
        self.state = PlayerState::Empty;
        self.sink.take()
    }
}

/// Gapless buffer queue with tail-id completion tracking.
///
/// `Send + Sync`; every method takes `&self`.
pub struct BufferQueuePlayer {
    output: Arc<dyn AudioOutput>,
    inner: Arc<Mutex<PlayerInner>>,
    notifier: Notifier,
    counters: Arc<PlayerCounters>,
}

impl BufferQueuePlayer {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAP);
        Self {
            output,
            inner: Arc::new(Mutex::new(PlayerInner {
                state: PlayerState::Empty,
                context: None,
                sink: None,
                generation: 0,
                last_id: None,
                pending: VecDeque::new(),
            })),
            notifier: Notifier {
                tx,
                seq: Arc::new(AtomicU64::new(0)),
            },
            counters: Arc::new(PlayerCounters::default()),
        }
    }

    /// Allocate a queue sink on an output context at `sample_rate`.
    ///
    /// The current context is reused when its rate matches; otherwise it is
    /// closed and a new one opened. Any live sink is released first.
    ///
    /// # Errors
    /// `QueuecastError::Resource` if the context or sink cannot be created.
    /// The player is left `Empty` in that case.
    pub fn create_sink(&self, sample_rate: u32) -> Result<()> {
        self.reset();

        let stale_context = {
            let mut inner = self.inner.lock();
            match &inner.context {
                Some(ctx) if ctx.sample_rate() != sample_rate => inner.context.take(),
                _ => None,
            }
        };
        if let Some(ctx) = stale_context {
            close_context(ctx);
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.context.is_none() {
            inner.context = Some(self.output.open_context(sample_rate)?);
            info!(sample_rate, "output context opened");
        }
        let Some(context) = inner.context.as_mut() else {
            return Err(QueuecastError::Resource("output context unavailable".into()));
        };

        let mut sink = context.create_queue_sink()?;
        inner.generation += 1;
        let generation = inner.generation;
        sink.set_on_entry_ended(self.completion_callback(generation));
        sink.connect()?;

        inner.sink = Some(sink);
        inner.state = PlayerState::Ready;
        inner.last_id = None;
        inner.pending.clear();
        info!(sample_rate, generation, "queue sink created");
        Ok(())
    }

    /// Append `chunk` to the FIFO and return its id.
    ///
    /// Valid in `Ready`, `Playing` and `Drained`. Enqueueing after a drain
    /// re-arms playback on the still-running sink.
    ///
    /// # Errors
    /// `QueuecastError::InvalidState` when no sink exists.
    pub fn enqueue(&self, chunk: AudioChunk) -> Result<BufferId> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(sink) = inner.sink.as_mut() else {
            return Err(QueuecastError::InvalidState(
                "enqueue on a player without a live sink".into(),
            ));
        };

        let frames = chunk.frames();
        let id = sink.enqueue_buffer(chunk)?;
        inner.last_id = Some(id);
        inner.pending.push_back((id, frames));
        self.counters
            .entries_enqueued
            .fetch_add(1, Ordering::Relaxed);
        debug!(%id, frames, generation = inner.generation, "entry enqueued");

        if inner.state == PlayerState::Drained {
            inner.state = PlayerState::Playing;
            self.notifier
                .emit(PlayerState::Playing, inner.generation, None);
            debug!(%id, "playback re-armed by late enqueue");
        }
        Ok(id)
    }

    /// Start draining the queue.
    ///
    /// No-op while `Playing` or `Drained`. With nothing to render (no entries,
    /// or only zero-length ones) the player moves straight to `Drained`.
    ///
    /// # Errors
    /// `QueuecastError::InvalidState` when no sink exists; sink start errors
    /// are propagated and the state is left unchanged.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.state {
            PlayerState::Empty => {
                return Err(QueuecastError::InvalidState(
                    "start on a player without a live sink".into(),
                ))
            }
            PlayerState::Playing | PlayerState::Drained => return Ok(()),
            PlayerState::Ready => {}
        }

        let when = inner
            .context
            .as_ref()
            .map(|ctx| ctx.current_time())
            .unwrap_or(0.0);
        let Some(sink) = inner.sink.as_mut() else {
            return Err(QueuecastError::InvalidState("sink missing in Ready".into()));
        };
        sink.start(when)?;

        if inner.pending.iter().all(|&(_, frames)| frames == 0) {
            inner.state = PlayerState::Drained;
            self.counters.drains.fetch_add(1, Ordering::Relaxed);
            self.notifier
                .emit(PlayerState::Drained, inner.generation, inner.last_id);
            info!(
                generation = inner.generation,
                "started with nothing to render; drained"
            );
        } else {
            inner.state = PlayerState::Playing;
            self.notifier
                .emit(PlayerState::Playing, inner.generation, None);
            info!(
                generation = inner.generation,
                pending = inner.pending.len(),
                "playback started"
            );
        }
        Ok(())
    }

    /// Clear pending entries, release the sink, and return to `Empty`.
    ///
    /// Safe from any state. Errors from a sink that is already torn down are
    /// logged, never returned. The output context stays open.
    pub fn reset(&self) {
        let (sink, was_playing, generation) = {
            let mut inner = self.inner.lock();
            let was_playing = inner.state.is_playing();
            let sink = inner.take_sink();
            (sink, was_playing, inner.generation)
        };
        if was_playing {
            self.notifier.emit(PlayerState::Empty, generation, None);
        }
        if let Some(sink) = sink {
            release_sink(sink);
            debug!(generation, "queue sink released");
        }
    }

    /// Alias for [`reset`](Self::reset).
    pub fn stop(&self) {
        self.reset();
    }

    /// `reset` plus closing the output context. Repeated calls are no-ops.
    pub fn teardown(&self) {
        self.reset();
        let context = self.inner.lock().context.take();
        if let Some(ctx) = context {
            close_context(ctx);
            info!("output context closed");
        }
    }

    pub fn state(&self) -> PlayerState {
        self.inner.lock().state
    }

    pub fn is_playing(&self) -> bool {
        self.state().is_playing()
    }

    /// Id most recently returned by `enqueue` on the live sink.
    pub fn last_buffer_id(&self) -> Option<BufferId> {
        self.inner.lock().last_id
    }

    /// Entries enqueued on the live sink and not yet reported finished.
    pub fn pending_entries(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn has_context(&self) -> bool {
        self.inner.lock().context.is_some()
    }

    /// Sample rate of the open context, if any.
    pub fn sample_rate(&self) -> Option<u32> {
        self.inner.lock().context.as_ref().map(|c| c.sample_rate())
    }

    /// Subscribe to `is_playing` changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackStatusEvent> {
        self.notifier.tx.subscribe()
    }

    pub fn counters(&self) -> PlayerCountersSnapshot {
        self.counters.snapshot()
    }

    fn completion_callback(&self, generation: u64) -> EntryEndedCallback {
        let inner: Weak<Mutex<PlayerInner>> = Arc::downgrade(&self.inner);
        let notifier = self.notifier.clone();
        let counters = Arc::clone(&self.counters);
        Arc::new(move |id| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            on_entry_finished(&inner, generation, id, &notifier, &counters);
        })
    }
}

impl std::fmt::Debug for BufferQueuePlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BufferQueuePlayer")
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("last_id", &inner.last_id)
            .field("pending", &inner.pending.len())
            .finish_non_exhaustive()
    }
}

fn on_entry_finished(
    inner: &Mutex<PlayerInner>,
    generation: u64,
    id: Option<BufferId>,
    notifier: &Notifier,
    counters: &PlayerCounters,
) {
    let mut inner = inner.lock();
    if inner.generation != generation || inner.sink.is_none() {
        counters.stale_events.fetch_add(1, Ordering::Relaxed);
        debug!(
            event_generation = generation,
            live_generation = inner.generation,
            ?id,
            "discarding completion from a released sink"
        );
        return;
    }

    let Some(id) = id else {
        inner.pending.clear();
        if inner.state == PlayerState::Playing {
            inner.state = PlayerState::Drained;
            counters.drains.fetch_add(1, Ordering::Relaxed);
            notifier.emit(PlayerState::Drained, generation, None);
        }
        warn!(generation, "queue sink stopped on its own");
        return;
    };

    counters.entries_finished.fetch_add(1, Ordering::Relaxed);
    while let Some(&(front, _)) = inner.pending.front() {
        inner.pending.pop_front();
        if front == id {
            break;
        }
    }

    if inner.state == PlayerState::Playing && inner.last_id == Some(id) {
        inner.state = PlayerState::Drained;
        counters.drains.fetch_add(1, Ordering::Relaxed);
        notifier.emit(PlayerState::Drained, generation, Some(id));
        info!(%id, generation, "queue drained");
    } else {
        debug!(%id, tail = ?inner.last_id, "entry finished");
    }
}

fn release_sink(mut sink: Box<dyn QueueSink>) {
    if let Err(e) = sink.stop() {
        warn!("queue sink stop failed during release: {e}");
    }
    if let Err(e) = sink.disconnect() {
        warn!("queue sink disconnect failed during release: {e}");
    }
}

fn close_context(mut ctx: Box<dyn OutputContext>) {
    if let Err(e) = ctx.close() {
        warn!("output context close failed: {e}");
    }
}
