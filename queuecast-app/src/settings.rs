//! Persistent host settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use queuecast_core::EngineConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Tone,
    Microphone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Device,
    Wav,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub sample_rate: u32,
    pub interval_ms: u32,
    pub source: SourceKind,
    pub output: OutputKind,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub wav_path: PathBuf,
    /// Where the merged transport text of a cycle is written, if anywhere.
    pub transport_path: Option<PathBuf>,
    pub tone_frequency: f32,
    pub capture_seconds: f32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            interval_ms: 1_000,
            source: SourceKind::Tone,
            output: OutputKind::Device,
            preferred_input_device: None,
            preferred_output_device: None,
            wav_path: PathBuf::from("queuecast.wav"),
            transport_path: None,
            tone_frequency: 440.0,
            capture_seconds: 5.0,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let engine = self.engine_config();
        self.sample_rate = engine.sample_rate;
        self.interval_ms = engine.interval_ms;
        self.tone_frequency = if self.tone_frequency.is_finite() {
            self.tone_frequency.clamp(20.0, self.sample_rate as f32 / 2.0)
        } else {
            440.0
        };
        self.capture_seconds = if self.capture_seconds.is_finite() {
            self.capture_seconds.clamp(0.1, 600.0)
        } else {
            5.0
        };
        self.preferred_input_device = normalize_device_name(self.preferred_input_device.take());
        self.preferred_output_device = normalize_device_name(self.preferred_output_device.take());
        if self.wav_path.as_os_str().is_empty() {
            self.wav_path = PathBuf::from("queuecast.wav");
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            sample_rate: self.sample_rate,
            interval_ms: self.interval_ms,
            channels: 1,
            record_transport: true,
        }
        .normalized()
    }
}

fn normalize_device_name(raw: Option<String>) -> Option<String> {
    raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Queuecast")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("queuecast")
            .join("settings.json")
    }
}

/// Missing or unreadable files yield normalized defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
