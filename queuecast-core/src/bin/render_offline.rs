//! Capture a synthetic tone through the full pipeline and render the playback
//! queue to a WAV file, without touching any audio device.

use std::path::PathBuf;
use std::sync::{atomic::Ordering, Arc};
use std::time::{Duration, Instant};

use queuecast_core::{
    playback::offline::write_wav, EngineConfig, IntervalSource, OfflineOutput, PlayerState,
    QueuecastEngine, ToneBackend,
};

const RENDER_BLOCK_FRAMES: usize = 1_024;

#[derive(Debug)]
struct Args {
    seconds: f64,
    sample_rate: u32,
    interval_ms: u32,
    frequency: f32,
    output: PathBuf,
    transport: Option<PathBuf>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("render-offline failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        seconds: 2.0,
        sample_rate: 16_000,
        interval_ms: 250,
        frequency: 440.0,
        output: PathBuf::from("queuecast-render.wav"),
        transport: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().ok_or_else(|| format!("missing value for {name}"));
        match arg.as_str() {
            "--seconds" => {
                args.seconds = value("--seconds")?
                    .parse::<f64>()
                    .map_err(|_| "invalid value for --seconds".to_string())?
                    .clamp(0.01, 600.0);
            }
            "--rate" => {
                args.sample_rate = value("--rate")?
                    .parse()
                    .map_err(|_| "invalid value for --rate".to_string())?;
            }
            "--interval-ms" => {
                args.interval_ms = value("--interval-ms")?
                    .parse()
                    .map_err(|_| "invalid value for --interval-ms".to_string())?;
            }
            "--frequency" => {
                args.frequency = value("--frequency")?
                    .parse()
                    .map_err(|_| "invalid value for --frequency".to_string())?;
            }
            "--output" => args.output = PathBuf::from(value("--output")?),
            "--transport" => args.transport = Some(PathBuf::from(value("--transport")?)),
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p queuecast-core --bin render-offline -- \\
  [--seconds <s>] [--rate <hz>] [--interval-ms <ms>] [--frequency <hz>] \\
  [--output <file.wav>] [--transport <file.txt>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let config = EngineConfig {
        sample_rate: args.sample_rate,
        interval_ms: args.interval_ms,
        ..EngineConfig::default()
    }
    .normalized();
    let total_frames = (config.sample_rate as f64 * args.seconds).round() as u64;

    let tone = ToneBackend::new(args.frequency, 0.5)
        .with_frame_limit(total_frames)
        .unpaced();
    let progress = tone.progress();
    let output = Arc::new(OfflineOutput::new(config.channels));
    let engine = QueuecastEngine::new(config.clone(), IntervalSource::new(tone), output.clone());

    engine.start_capture().map_err(|e| e.to_string())?;
    let deadline = Instant::now() + Duration::from_secs(30);
    while progress.load(Ordering::Acquire) < total_frames {
        if Instant::now() > deadline {
            return Err("tone generator stalled".into());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    engine.stop_capture().map_err(|e| e.to_string())?;

    engine.play().map_err(|e| e.to_string())?;
    let mut rendered: Vec<f32> = Vec::with_capacity(total_frames as usize);
    let limit = (total_frames as usize + RENDER_BLOCK_FRAMES) * config.channels as usize;
    while engine.player_state() != PlayerState::Drained && rendered.len() < limit {
        rendered.extend(output.render(RENDER_BLOCK_FRAMES));
    }
    rendered.truncate(total_frames as usize * config.channels as usize);

    write_wav(&args.output, &rendered, config.sample_rate, config.channels)
        .map_err(|e| e.to_string())?;

    if let Some(path) = &args.transport {
        let text = engine.recording().map_err(|e| e.to_string())?;
        std::fs::write(path, text.as_str()).map_err(|e| e.to_string())?;
    }

    let diag = engine.diagnostics_snapshot();
    println!(
        "rendered {} frames from {} chunks to {} (drains: {}, stale events: {})",
        rendered.len() / config.channels as usize,
        diag.chunks_captured,
        args.output.display(),
        diag.drains,
        diag.stale_events
    );
    engine.shutdown();
    Ok(())
}
