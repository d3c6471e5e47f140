//! Audio energy pipeline: microphone capture and voice activity detection.

#[cfg(feature = "audio-io")]
pub mod capture;
pub mod monitor;

#[cfg(feature = "audio-io")]
pub use capture::{frame_rms, AudioCapture, LevelSample};
pub use monitor::{VadConfig, VadEvent, VoiceActivityMonitor};
