//! Configuration for the coordinator and its components.
//!
//! Provides centralized configuration: endpoints, voice parameters and
//! the detection thresholds, with builder methods for overrides.

use crate::audio::monitor::VadConfig;
use crate::speech::output::VoiceParams;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the complete voice coordinator.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Duplex server endpoint (ws:// or wss://).
    pub server_url: String,

    /// REST base for inbox and memory endpoints.
    pub api_base: String,

    /// Where the device identity record lives.
    pub device_file: PathBuf,

    /// Speech detection thresholds.
    pub vad: VadConfig,

    /// Narration voice parameters.
    pub voice: VoiceParams,

    /// Inbox poll period.
    pub poll_interval: Duration,

    /// Delay before the first inbox poll after startup.
    pub startup_poll_delay: Duration,

    /// Whether to capture microphone audio.
    pub enable_audio_input: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws".to_string(),
            api_base: "http://localhost:8080".to_string(),
            device_file: PathBuf::from("device.json"),
            vad: VadConfig::default(),
            voice: VoiceParams::default(),
            poll_interval: Duration::from_secs(120),
            startup_poll_delay: Duration::from_secs(2),
            enable_audio_input: true,
        }
    }
}

impl AppConfig {
    /// Create a configuration pointing at a specific server.
    pub fn with_server(server_url: impl Into<String>, api_base: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.server_url = server_url.into();
        config.api_base = api_base.into();
        config
    }

    /// Override the detection thresholds.
    pub fn with_vad(mut self, vad: VadConfig) -> Self {
        self.vad = vad;
        self
    }

    /// Override the voice parameters.
    pub fn with_voice(mut self, voice: VoiceParams) -> Self {
        self.voice = voice;
        self
    }

    /// Override the device record path.
    pub fn with_device_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_file = path.into();
        self
    }

    /// Disable microphone capture (narration-only mode).
    pub fn without_audio_input(mut self) -> Self {
        self.enable_audio_input = false;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(format!("server_url must be a ws(s) url: {}", self.server_url));
        }
        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            return Err(format!("api_base must be an http(s) url: {}", self.api_base));
        }
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be positive".to_string());
        }
        Ok(())
    }
}
