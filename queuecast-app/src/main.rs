//! Queuecast loopback host.
//!
//! Captures from a tone or the microphone, streams every interval chunk into
//! the playback queue, and either plays it live on an output device or
//! renders it to a WAV file. The merged transport text of the cycle can be
//! saved and replayed later with `--play`.
//!
//! ## Runtime note
//!
//! Engine calls are short and synchronous; the Tokio runtime only drives the
//! event-forwarding tasks and the capture timer.

mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use queuecast_core::{
    capture::CaptureSource, playback::offline::write_wav, AudioOutput, CpalBackend, CpalOutput,
    EncodedChunk, EngineConfig, IntervalSource, OfflineOutput, PlaybackStatusEvent, PlayerState,
    QueuecastEngine, ToneBackend,
};
use settings::{
    default_settings_path, load_settings, save_settings, AppSettings, OutputKind, SourceKind,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Extra time allowed for the queue to drain after capture stops.
const DRAIN_GRACE: Duration = Duration::from_secs(5);
const RENDER_BLOCK_FRAMES: usize = 1_024;

#[derive(Debug, Default)]
struct Args {
    settings_path: Option<PathBuf>,
    save: bool,
    play: Option<PathBuf>,
    seconds: Option<f32>,
    source: Option<SourceKind>,
    output: Option<OutputKind>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .ok_or_else(|| anyhow!("missing value for {name}"))
        };
        match arg.as_str() {
            "--settings" => args.settings_path = Some(PathBuf::from(value("--settings")?)),
            "--save-settings" => args.save = true,
            "--play" => args.play = Some(PathBuf::from(value("--play")?)),
            "--seconds" => {
                args.seconds = Some(
                    value("--seconds")?
                        .parse()
                        .context("invalid value for --seconds")?,
                )
            }
            "--source" => {
                args.source = Some(match value("--source")?.as_str() {
                    "tone" => SourceKind::Tone,
                    "mic" | "microphone" => SourceKind::Microphone,
                    other => bail!("unknown source: {other}"),
                })
            }
            "--output" => {
                args.output = Some(match value("--output")?.as_str() {
                    "device" => OutputKind::Device,
                    "wav" => OutputKind::Wav,
                    other => bail!("unknown output: {other}"),
                })
            }
            "--help" | "-h" => {
                println!(
                    "Usage: queuecast [--settings <file>] [--save-settings] \\
  [--source tone|microphone] [--output device|wav] [--seconds <s>] [--play <transport-file>]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("queuecast=info")),
        )
        .init();

    let args = parse_args()?;
    let settings_path = args
        .settings_path
        .clone()
        .unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    if let Some(seconds) = args.seconds {
        settings.capture_seconds = seconds;
    }
    if let Some(source) = args.source {
        settings.source = source;
    }
    if let Some(output) = args.output {
        settings.output = output;
    }
    settings.normalize();
    info!(path = %settings_path.display(), ?settings, "settings loaded");

    if args.save {
        save_settings(&settings_path, &settings)
            .with_context(|| format!("saving {}", settings_path.display()))?;
        info!("settings saved");
    }

    let config = settings.engine_config();
    match settings.source {
        SourceKind::Tone => {
            let tone = ToneBackend::new(settings.tone_frequency, 0.4);
            run(&settings, config, IntervalSource::new(tone), args.play.as_deref()).await
        }
        SourceKind::Microphone => {
            let mic = match &settings.preferred_input_device {
                Some(name) => CpalBackend::with_device(name.clone()),
                None => CpalBackend::new(),
            };
            run(&settings, config, IntervalSource::new(mic), args.play.as_deref()).await
        }
    }
}

async fn run<S: CaptureSource>(
    settings: &AppSettings,
    config: EngineConfig,
    source: S,
    replay: Option<&Path>,
) -> anyhow::Result<()> {
    let offline = Arc::new(OfflineOutput::new(config.channels));
    let output: Arc<dyn AudioOutput> = match settings.output {
        OutputKind::Device => match &settings.preferred_output_device {
            Some(name) => Arc::new(CpalOutput::with_device(name.clone())),
            None => Arc::new(CpalOutput::new()),
        },
        OutputKind::Wav => Arc::clone(&offline) as Arc<dyn AudioOutput>,
    };
    let engine = QueuecastEngine::new(config, source, output);
    spawn_event_logging(&engine);

    if let Some(path) = replay {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let chunk = EncodedChunk::parse(&text)?;
        let playback = engine.subscribe_playback();
        engine.play_encoded(&chunk)?;
        info!(path = %path.display(), "replaying recording");
        finish_playback(settings, &engine, &offline, playback).await?;
        engine.shutdown();
        return Ok(());
    }

    engine.start_capture()?;
    if settings.output == OutputKind::Device {
        // Live loopback: play each chunk as soon as it lands in the queue.
        engine.play()?;
    }
    tokio::time::sleep(Duration::from_secs_f32(settings.capture_seconds)).await;
    engine.stop_capture()?;

    if settings.output == OutputKind::Wav {
        engine.play()?;
    }
    // Drains seen while capture was still feeding the queue do not count.
    let playback = engine.subscribe_playback();
    finish_playback(settings, &engine, &offline, playback).await?;

    if let Some(path) = &settings.transport_path {
        let recording = engine.recording()?;
        std::fs::write(path, recording.as_str())
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "transport recording saved");
    }

    let diag = engine.diagnostics_snapshot();
    info!(
        chunks = diag.chunks_captured,
        frames = diag.frames_captured,
        finished = diag.entries_finished,
        drains = diag.drains,
        stale = diag.stale_events,
        "cycle complete"
    );
    engine.shutdown();
    Ok(())
}

/// Wait for the queue to drain on a device, or pull it into a WAV file.
async fn finish_playback<S: CaptureSource>(
    settings: &AppSettings,
    engine: &QueuecastEngine<S>,
    offline: &OfflineOutput,
    mut playback: broadcast::Receiver<PlaybackStatusEvent>,
) -> anyhow::Result<()> {
    match settings.output {
        OutputKind::Device => {
            if engine.player_state() == PlayerState::Drained {
                return Ok(());
            }
            let wait = async {
                loop {
                    match playback.recv().await {
                        Ok(ev) if !ev.is_playing && ev.state == PlayerState::Drained => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(n, "playback events lagged");
                            if engine.player_state() == PlayerState::Drained {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            if tokio::time::timeout(DRAIN_GRACE, wait).await.is_err() {
                warn!("playback did not drain in time");
            }
        }
        OutputKind::Wav => {
            let mut rendered = Vec::new();
            let max_frames = (settings.capture_seconds as f64 * engine.config().sample_rate as f64)
                as usize
                + engine.config().sample_rate as usize;
            while engine.player_state() != PlayerState::Drained
                && rendered.len() / engine.config().channels as usize <= max_frames
            {
                rendered.extend(offline.render(RENDER_BLOCK_FRAMES));
            }
            write_wav(
                &settings.wav_path,
                &rendered,
                engine.config().sample_rate,
                engine.config().channels,
            )?;
            info!(path = %settings.wav_path.display(), "queue rendered to wav");
        }
    }
    Ok(())
}

fn spawn_event_logging<S: CaptureSource>(engine: &QueuecastEngine<S>) {
    let mut playback = engine.subscribe_playback();
    tokio::spawn(async move {
        while let Ok(ev) = playback.recv().await {
            info!(
                is_playing = ev.is_playing,
                state = ?ev.state,
                generation = ev.generation,
                buffer = ?ev.buffer_id,
                "playback status"
            );
        }
    });

    let mut capture = engine.subscribe_capture();
    tokio::spawn(async move {
        while let Ok(ev) = capture.recv().await {
            match &ev.detail {
                Some(detail) => warn!(state = ?ev.state, "capture status: {detail}"),
                None => info!(is_streaming = ev.is_streaming, state = ?ev.state, "capture status"),
            }
        }
    });

    let mut chunks = engine.subscribe_chunks();
    tokio::spawn(async move {
        while let Ok(ev) = chunks.recv().await {
            debug!(
                index = ev.index,
                frames = ev.frames,
                duration_ms = ev.duration_ms,
                buffer = ?ev.buffer_id,
                "chunk captured"
            );
        }
    });
}
