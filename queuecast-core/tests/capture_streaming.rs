use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use approx::assert_abs_diff_eq;
use queuecast_core::buffering::SampleProducer;
use queuecast_core::capture::{tone::fill_tone, FrameBackend};
use queuecast_core::playback::OutputContext;
use queuecast_core::{
    decode_samples, encode_samples, AudioOutput, CaptureConfig, CaptureState, ChunkCapturedEvent, EngineConfig,
    IntervalSource, OfflineOutput, PlayerState, QueuecastEngine, QueuecastError, ToneBackend,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

fn recv_chunk_with_timeout(
    rx: &mut broadcast::Receiver<ChunkCapturedEvent>,
    timeout: Duration,
) -> ChunkCapturedEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for chunk event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("chunk channel closed unexpectedly"),
        }
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < timeout, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn tone_capture_streams_every_frame_through_the_queue() {
    const RATE: u32 = 8_000;
    const TOTAL: u64 = 4_400;

    let tone = ToneBackend::new(440.0, 0.5)
        .with_frame_limit(TOTAL)
        .unpaced();
    let progress = tone.progress();
    let output = Arc::new(OfflineOutput::new(1));
    let config = EngineConfig {
        sample_rate: RATE,
        interval_ms: 100,
        ..EngineConfig::default()
    };
    let engine = QueuecastEngine::new(config, IntervalSource::new(tone), output.clone());
    let mut chunks = engine.subscribe_chunks();

    engine.start_capture().unwrap();
    wait_until(Duration::from_secs(5), || {
        progress.load(Ordering::Acquire) >= TOTAL
    });
    engine.stop_capture().unwrap();
    assert_eq!(engine.capture_state(), CaptureState::Idle);

    // 800 frames per interval: five full chunks and a 400-frame tail.
    let events: Vec<ChunkCapturedEvent> = std::iter::from_fn(|| chunks.try_recv().ok()).collect();
    let indices: Vec<u64> = events.iter().map(|e| e.index).collect();
    let frames: Vec<usize> = events.iter().map(|e| e.frames).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(frames, vec![800, 800, 800, 800, 800, 400]);
    assert!(events.iter().all(|e| e.buffer_id.is_some()));

    engine.play().unwrap();
    let rendered = output.render(TOTAL as usize);
    assert_eq!(engine.player_state(), PlayerState::Drained);

    let mut expected = vec![0.0f32; TOTAL as usize];
    fill_tone(&mut expected, 0, 1, RATE, 440.0, 0.5);
    for (got, want) in rendered.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*got, *want, epsilon = 1e-6);
    }

    let recorded = decode_samples(&engine.recording().unwrap()).unwrap();
    assert_eq!(recorded.len(), TOTAL as usize);
    for (got, want) in recorded.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*got, *want, epsilon = 3.0 / 32768.0);
    }

    let diag = engine.diagnostics_snapshot();
    assert_eq!(diag.chunks_captured, 6);
    assert_eq!(diag.frames_captured, TOTAL as usize);
    assert_eq!(diag.entries_finished, 6);
    assert_eq!(diag.drains, 1);
}

#[test]
fn paced_capture_plays_while_it_streams() {
    let output = Arc::new(OfflineOutput::new(1));
    let config = EngineConfig {
        sample_rate: 8_000,
        interval_ms: 20,
        ..EngineConfig::default()
    };
    let engine = QueuecastEngine::new(
        config,
        IntervalSource::new(ToneBackend::new(220.0, 0.3)),
        output.clone(),
    );
    let mut chunks = engine.subscribe_chunks();
    engine.start_capture().unwrap();
    engine.play().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let render_thread = {
        let output = Arc::clone(&output);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                output.render(80);
                thread::sleep(Duration::from_millis(10));
            }
        })
    };

    for expected in 0..3u64 {
        let event = recv_chunk_with_timeout(&mut chunks, Duration::from_secs(2));
        assert_eq!(event.index, expected);
        assert_eq!(event.frames, 160);
    }

    engine.stop_capture().unwrap();
    running.store(false, Ordering::Release);
    render_thread.join().unwrap();

    let diag = engine.diagnostics_snapshot();
    assert!(diag.chunks_captured >= 3);
    assert_eq!(diag.enqueue_errors, 0);
    assert!(diag.entries_enqueued >= 3);

    engine.shutdown();
    assert_eq!(output.open_contexts(), 0);
}

struct DeniedBackend;

impl FrameBackend for DeniedBackend {
    fn check_permission(&self) -> queuecast_core::Result<()> {
        Err(QueuecastError::PermissionDenied(
            "record permission not granted".into(),
        ))
    }

    fn open(
        &mut self,
        _config: &CaptureConfig,
        _producer: SampleProducer,
    ) -> queuecast_core::Result<()> {
        unreachable!("open must not run without permission")
    }

    fn close(&mut self) {}
}

#[test]
fn denied_capture_leaves_no_session_allocated() {
    let output = Arc::new(OfflineOutput::new(1));
    let engine = QueuecastEngine::new(
        EngineConfig::default(),
        IntervalSource::new(DeniedBackend),
        output.clone(),
    );
    let mut status = engine.subscribe_capture();

    let err = engine.start_capture().unwrap_err();
    assert!(matches!(err, QueuecastError::PermissionDenied(_)));
    assert_eq!(output.open_contexts(), 0);
    assert!(!engine.session().is_active());
    assert_eq!(engine.capture_state(), CaptureState::Idle);

    let event = status.try_recv().unwrap();
    assert!(!event.is_streaming);
    assert!(event.detail.unwrap().contains("permission"));
}

/// Counts every context the engine asks for.
struct CountingOutput {
    inner: OfflineOutput,
    opened: AtomicUsize,
}

impl AudioOutput for CountingOutput {
    fn open_context(&self, sample_rate: u32) -> queuecast_core::Result<Box<dyn OutputContext>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.open_context(sample_rate)
    }
}

#[test]
fn denied_capture_does_not_disturb_a_live_replay() {
    let output = Arc::new(CountingOutput {
        inner: OfflineOutput::new(1),
        opened: AtomicUsize::new(0),
    });
    let config = EngineConfig {
        sample_rate: 8_000,
        ..EngineConfig::default()
    };
    let engine = QueuecastEngine::new(config, IntervalSource::new(DeniedBackend), output.clone());
    engine.play_encoded(&encode_samples(&[0.5; 8_000])).unwrap();
    let generation = engine.session().player().generation();
    let mut playback = engine.subscribe_playback();

    let err = engine.start_capture().unwrap_err();
    assert!(matches!(err, QueuecastError::PermissionDenied(_)));

    assert!(engine.is_playing());
    assert_eq!(engine.session().player().generation(), generation);
    assert_eq!(output.opened.load(Ordering::SeqCst), 1);
    assert_eq!(output.inner.open_contexts(), 1);
    assert!(matches!(playback.try_recv(), Err(TryRecvError::Empty)));

    output.inner.render(8_000);
    assert_eq!(engine.player_state(), PlayerState::Drained);
}
