//! Microphone capture via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority. It
//! must not block on a mutex or perform I/O, so it converts samples into a
//! scratch buffer and pushes them into the SPSC ring producer, whose
//! `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms, while `FrameBackend` must be
//! `Send`. The stream is built, kept alive and dropped on a dedicated thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use crossbeam_channel::{bounded, Sender};
use tracing::{error, info, warn};

use super::{interval::FrameBackend, CaptureConfig};
use crate::buffering::{Producer, SampleProducer};
use crate::error::{QueuecastError, Result};

/// Frame backend reading from the default (or a named) input device.
#[derive(Default)]
pub struct CpalBackend {
    preferred_device: Option<String>,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(name: impl Into<String>) -> Self {
        let mut backend = Self::default();
        backend.preferred_device = Some(name.into());
        backend
    }
}

impl FrameBackend for CpalBackend {
    fn check_permission(&self) -> Result<()> {
        // cpal exposes no permission API; an input device must at least exist.
        let host = cpal::default_host();
        let has_input = host.default_input_device().is_some()
            || host
                .input_devices()
                .map(|mut devices| devices.next().is_some())
                .unwrap_or(false);
        if has_input {
            Ok(())
        } else {
            Err(QueuecastError::Resource("no input device available".into()))
        }
    }

    fn open(&mut self, config: &CaptureConfig, producer: SampleProducer) -> Result<()> {
        self.close();
        let (open_tx, open_rx) = bounded::<Result<()>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let preferred = self.preferred_device.clone();
        let running = Arc::clone(&self.running);
        let config = *config;
        running.store(true, Ordering::Release);

        let thread = std::thread::Builder::new()
            .name("queuecast-capture".into())
            .spawn(move || {
                let stream =
                    match open_stream(&config, preferred.as_deref(), producer, running) {
                        Ok(stream) => {
                            let _ = open_tx.send(Ok(()));
                            stream
                        }
                        Err(e) => {
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(QueuecastError::Io)?;

        match open_rx.recv() {
            Ok(Ok(())) => {
                self.shutdown_tx = Some(shutdown_tx);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::Release);
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::Release);
                Err(QueuecastError::AudioStream(
                    "capture thread died before opening the device".into(),
                ))
            }
        }
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("capture thread panicked");
            }
        }
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.close();
    }
}

fn select_device(preferred: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    if let Some(name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!("preferred input device '{name}' not found, falling back");
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }
    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }
    let mut devices = host
        .input_devices()
        .map_err(|e| QueuecastError::Resource(e.to_string()))?;
    let fallback = devices
        .next()
        .ok_or_else(|| QueuecastError::Resource("no input device available".into()))?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

fn open_stream(
    config: &CaptureConfig,
    preferred: Option<&str>,
    producer: SampleProducer,
    running: Arc<AtomicBool>,
) -> Result<Stream> {
    let device = select_device(preferred)?;
    let supported = device
        .default_input_config()
        .map_err(|e| QueuecastError::Resource(e.to_string()))?;
    let device_channels = supported.channels();
    let target_channels = config.channels.max(1);
    if target_channels != 1 && target_channels != device_channels {
        return Err(QueuecastError::InvalidConfig(format!(
            "device has {device_channels} channels, cannot deliver {target_channels}"
        )));
    }

    let stream_config = StreamConfig {
        channels: device_channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    info!(
        device = device.name().unwrap_or_default().as_str(),
        sample_rate = config.sample_rate,
        device_channels,
        target_channels,
        "opening input device"
    );

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream::<f32, _>(
            &device,
            &stream_config,
            target_channels,
            producer,
            running,
            |s| s,
        ),
        SampleFormat::I16 => build_stream::<i16, _>(
            &device,
            &stream_config,
            target_channels,
            producer,
            running,
            |s| s as f32 / 32768.0,
        ),
        SampleFormat::U8 => build_stream::<u8, _>(
            &device,
            &stream_config,
            target_channels,
            producer,
            running,
            |s| (s as f32 - 128.0) / 128.0,
        ),
        fmt => {
            return Err(QueuecastError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| QueuecastError::AudioStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| QueuecastError::AudioStream(e.to_string()))?;
    Ok(stream)
}

/// Build an input stream converting `T` samples to f32, downmixing to mono
/// when `target_channels` is 1.
fn build_stream<T, F>(
    device: &Device,
    config: &StreamConfig,
    target_channels: u16,
    mut producer: SampleProducer,
    running: Arc<AtomicBool>,
    convert: F,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    F: Fn(T) -> f32 + Send + 'static,
{
    let ch = config.channels.max(1) as usize;
    let downmix = target_channels == 1 && ch > 1;
    let mut scratch: Vec<f32> = Vec::new();

    device.build_input_stream(
        config,
        move |data: &[T], _info: &cpal::InputCallbackInfo| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            if downmix {
                let frames = data.len() / ch;
                scratch.resize(frames, 0.0);
                for (f, frame) in data.chunks_exact(ch).enumerate() {
                    let sum: f32 = frame.iter().map(|&s| convert(s)).sum();
                    scratch[f] = sum / ch as f32;
                }
            } else {
                scratch.resize(data.len(), 0.0);
                for (out, &s) in scratch.iter_mut().zip(data) {
                    *out = convert(s);
                }
            }
            let written = producer.push_slice(&scratch);
            if written < scratch.len() {
                warn!(
                    "ring buffer full: dropped {} samples",
                    scratch.len() - written
                );
            }
        },
        |err: cpal::StreamError| error!("audio input stream error: {err}"),
        None,
    )
}
