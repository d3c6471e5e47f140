//! RMS-based voice activity detection with hysteresis.
//!
//! The monitor classifies a continuous stream of per-frame energy readings
//! into speak/silence events. Start-of-speech requires the level to stay
//! above threshold for a minimum duration; end-of-speech requires two
//! consecutive silence confirmations spaced a full silence window apart, so
//! breaths and short pauses never end a turn early.

use std::time::{Duration, Instant};
use tracing::debug;

/// Tuning for the activity monitor.
///
/// The threshold and minimum-speech duration are deployment-dependent
/// (0.07–0.17 and 250–700 ms have both shipped); they are plain fields
/// rather than constants.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS level separating silence from speech.
    pub threshold: f32,

    /// Sustained above-threshold duration before declaring speech.
    pub min_speak: Duration,

    /// Below-threshold duration for each of the two end-of-speech checks.
    pub min_silence: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.17,
            min_speak: Duration::from_millis(250),
            min_silence: Duration::from_millis(2000),
        }
    }
}

impl VadConfig {
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_min_speak(mut self, min_speak: Duration) -> Self {
        self.min_speak = min_speak;
        self
    }

    pub fn with_min_silence(mut self, min_silence: Duration) -> Self {
        self.min_silence = min_silence;
        self
    }
}

/// Event emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// The user started a distinct utterance (fired once per utterance).
    SpeechStart,
    /// The utterance reliably ended (after double confirmation).
    SpeechEnd,
}

/// Pending end-of-speech confirmation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SilenceCheck {
    None,
    First { due: Instant },
    Second { due: Instant },
}

/// Hysteretic speak/silence classifier over an RMS stream.
///
/// Entirely tick-driven: `on_level` is called once per captured frame and
/// all timing is derived from the supplied timestamps, which keeps the
/// two-stage silence chain testable without a frame loop.
pub struct VoiceActivityMonitor {
    config: VadConfig,
    above_since: Option<Instant>,
    speaking: bool,
    silence: SilenceCheck,
}

impl VoiceActivityMonitor {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            above_since: None,
            speaking: false,
            silence: SilenceCheck::None,
        }
    }

    /// Feed one frame's RMS level; returns at most one event per tick.
    pub fn on_level(&mut self, rms: f32, now: Instant) -> Option<VadEvent> {
        if rms > self.config.threshold {
            // Sound again before the confirmations ran out: keep the turn.
            if self.silence != SilenceCheck::None {
                debug!("silence check cancelled, level back above threshold");
                self.silence = SilenceCheck::None;
            }

            let since = *self.above_since.get_or_insert(now);
            if !self.speaking && now.duration_since(since) >= self.config.min_speak {
                self.speaking = true;
                debug!(rms, "speech start");
                return Some(VadEvent::SpeechStart);
            }
            return None;
        }

        // Below threshold.
        if !self.speaking {
            // A dip before min_speak elapsed resets the continuity clock.
            self.above_since = None;
            return None;
        }

        match self.silence {
            SilenceCheck::None => {
                self.silence = SilenceCheck::First {
                    due: now + self.config.min_silence,
                };
                None
            }
            SilenceCheck::First { due } if now >= due => {
                self.silence = SilenceCheck::Second {
                    due: now + self.config.min_silence,
                };
                None
            }
            SilenceCheck::Second { due } if now >= due => {
                self.speaking = false;
                self.above_since = None;
                self.silence = SilenceCheck::None;
                debug!("speech end confirmed");
                Some(VadEvent::SpeechEnd)
            }
            _ => None,
        }
    }

    /// Whether the monitor currently classifies the user as speaking.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.config.threshold = threshold.clamp(0.0, 1.0);
    }
}
