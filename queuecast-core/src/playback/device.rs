//! Output contexts backed by a cpal output device.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), while `OutputContext` must be `Send`. Each context therefore owns a
//! dedicated thread that builds the stream, reports the open result over a
//! channel, and parks until the context is closed. The stream is dropped on
//! that same thread.

use std::thread::JoinHandle;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};
use crossbeam_channel::{bounded, Sender};
use tracing::{error, info, warn};

use super::{AudioOutput, Destination, OutputContext, QueueSink, SoftwareQueueSink};
use crate::error::{QueuecastError, Result};

/// Opens contexts on the default (or a named) output device.
#[derive(Debug, Clone, Default)]
pub struct CpalOutput {
    preferred_device: Option<String>,
}

impl CpalOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            preferred_device: Some(name.into()),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn open_context(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>> {
        let (open_tx, open_rx) = bounded::<Result<Destination>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let preferred = self.preferred_device.clone();

        let thread = std::thread::Builder::new()
            .name("queuecast-output".into())
            .spawn(move || {
                let stream = match open_stream(sample_rate, preferred.as_deref()) {
                    Ok((stream, destination)) => {
                        let _ = open_tx.send(Ok(destination));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                // Returns on close() or when the context is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(QueuecastError::Io)?;

        match open_rx.recv() {
            Ok(Ok(destination)) => Ok(Box::new(CpalContext {
                destination,
                shutdown_tx: Some(shutdown_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(QueuecastError::Resource(
                "output thread died before opening the device".into(),
            )),
        }
    }
}

fn open_stream(sample_rate: u32, preferred: Option<&str>) -> Result<(Stream, Destination)> {
    let host = cpal::default_host();
    let mut selected = None;
    if let Some(name) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                selected = devices.find(|d| d.name().map(|n| n == name).unwrap_or(false));
                if selected.is_none() {
                    warn!("preferred output device '{name}' not found, falling back");
                }
            }
            Err(e) => warn!("failed to list output devices: {e}"),
        }
    }
    let device = match selected {
        Some(d) => d,
        None => host
            .default_output_device()
            .ok_or_else(|| QueuecastError::Resource("no default output device".into()))?,
    };

    let supported = device
        .default_output_config()
        .map_err(|e| QueuecastError::Resource(e.to_string()))?;
    let channels = supported.channels();
    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    info!(
        device = device.name().unwrap_or_default().as_str(),
        sample_rate, channels, "opening output device"
    );

    let destination = Destination::new(sample_rate, channels);
    let err_fn = |err: cpal::StreamError| error!("audio output stream error: {err}");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            let dest = destination.clone();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    dest.render(data);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let dest = destination.clone();
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    scratch.resize(data.len(), 0.0);
                    dest.render(&mut scratch);
                    for (out, s) in data.iter_mut().zip(scratch.iter()) {
                        let s = s.clamp(-1.0, 1.0);
                        *out = if s < 0.0 {
                            (s * 32768.0) as i16
                        } else {
                            (s * 32767.0) as i16
                        };
                    }
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let dest = destination.clone();
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [u16], _info| {
                    scratch.resize(data.len(), 0.0);
                    dest.render(&mut scratch);
                    for (out, s) in data.iter_mut().zip(scratch.iter()) {
                        *out = ((s.clamp(-1.0, 1.0) * 32767.0) + 32768.0) as u16;
                    }
                },
                err_fn,
                None,
            )
        }
        fmt => {
            return Err(QueuecastError::Resource(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| QueuecastError::Resource(e.to_string()))?;

    stream
        .play()
        .map_err(|e| QueuecastError::Resource(e.to_string()))?;
    Ok((stream, destination))
}

/// Context whose destination is the output device.
pub struct CpalContext {
    destination: Destination,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputContext for CpalContext {
    fn sample_rate(&self) -> u32 {
        self.destination.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.destination.current_time()
    }

    fn create_queue_sink(&mut self) -> Result<Box<dyn QueueSink>> {
        if self.shutdown_tx.is_none() {
            return Err(QueuecastError::Resource("output context is closed".into()));
        }
        Ok(Box::new(SoftwareQueueSink::new(self.destination.clone())))
    }

    fn close(&mut self) -> Result<()> {
        self.destination.close();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| QueuecastError::Resource("output thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for CpalContext {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("output context close failed on drop: {e}");
        }
    }
}
