//! Continuous recognition lifecycle and transcript buffering.
//!
//! The recognizer stops around every assistant utterance and must be
//! restarted afterwards; final transcript fragments are buffered until a
//! quiet period before being dispatched. Debounce and restart delays are
//! modeled as timer messages stamped with a generation, never as callbacks
//! the engine cancels.

use crate::Result;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Quiet period after the last final fragment before dispatching.
pub const SILENCE_TO_SEND: Duration = Duration::from_millis(1000);
/// Delay before restarting recognition after the recognizer ends.
pub const RESTART_RECOGNITION_DELAY: Duration = Duration::from_millis(300);

/// Speech-to-text engine seam. The platform adapter reports lifecycle and
/// result events back to the coordinator.
pub trait Recognizer {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
}

/// Owns the recognizer's start/stop lifecycle and the pending transcript.
pub struct SpeechInputEngine<R: Recognizer> {
    recognizer: R,
    active: bool,
    starting: bool,
    /// Set on permission/service faults; the feature stays off.
    disabled: bool,
    /// Foreground visibility; restarts are suppressed in the background.
    foreground: bool,
    pending: String,
    debounce_generation: u64,
}

impl<R: Recognizer> SpeechInputEngine<R> {
    pub fn new(recognizer: R) -> Self {
        Self {
            recognizer,
            active: false,
            starting: false,
            disabled: false,
            foreground: true,
            pending: String::new(),
            debounce_generation: 0,
        }
    }

    /// Start listening. No-op while already active, starting, or disabled.
    pub fn start(&mut self) {
        if self.active || self.starting || self.disabled {
            return;
        }
        self.starting = true;
        if let Err(e) = self.recognizer.start() {
            self.starting = false;
            if e.is_recoverable() {
                warn!("recognizer start failed: {}", e);
            } else {
                warn!("recognizer unavailable, disabling voice input: {}", e);
                self.disabled = true;
            }
        }
    }

    /// Stop listening. Safe to call in any state.
    pub fn stop(&mut self) {
        if self.active {
            self.recognizer.stop();
        }
    }

    /// The recognizer confirmed it is running.
    pub fn on_started(&mut self) {
        self.active = true;
        self.starting = false;
    }

    /// Interim results are a display-only concern; always dropped.
    pub fn on_interim(&self, text: &str) {
        debug!(text, "interim result dropped");
    }

    /// A final transcript fragment arrived. While the assistant is
    /// narrating the fragment is dropped (the recognizer would otherwise
    /// hear the assistant's own voice). Otherwise it is buffered and the
    /// debounce restarts; the returned generation stamps the timer.
    pub fn on_final(&mut self, text: &str, assistant_speaking: bool) -> Option<(u64, Duration)> {
        if assistant_speaking {
            debug!("final result dropped while assistant is narrating");
            return None;
        }
        let fragment = text.trim();
        if fragment.is_empty() {
            return None;
        }
        if !self.pending.is_empty() {
            self.pending.push(' ');
        }
        self.pending.push_str(fragment);
        self.debounce_generation += 1;
        Some((self.debounce_generation, SILENCE_TO_SEND))
    }

    /// The debounce timer with `generation` fired. Yields the buffered
    /// transcript if no newer fragment superseded the timer.
    pub fn on_debounce(&mut self, generation: u64) -> Option<String> {
        if generation != self.debounce_generation || self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    /// The recognizer terminated. Returns the delay after which a restart
    /// should be attempted, or None when the feature is disabled.
    pub fn on_ended(&mut self) -> Option<Duration> {
        self.active = false;
        self.starting = false;
        if self.disabled {
            None
        } else {
            Some(RESTART_RECOGNITION_DELAY)
        }
    }

    /// The scheduled restart came due. Restarts only in the foreground and
    /// only when neither party holds the floor.
    pub fn on_restart_due(&mut self, turn_is_idle: bool) {
        if !self.foreground {
            debug!("restart suppressed: backgrounded");
            return;
        }
        if !turn_is_idle {
            debug!("restart suppressed: floor is held");
            return;
        }
        self.start();
    }

    /// Permission or service fault: stop for good, no rescheduling.
    pub fn on_fault(&mut self, reason: &str) {
        info!("recognizer fault, voice input disabled: {}", reason);
        self.disabled = true;
        self.stop();
    }

    pub fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn pending_transcript(&self) -> &str {
        &self.pending
    }

    pub fn recognizer_mut(&mut self) -> &mut R {
        &mut self.recognizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompaniaError;

    #[derive(Default)]
    struct FakeRecognizer {
        starts: usize,
        stops: usize,
        fail_start: bool,
        fail_fatal: bool,
    }

    impl Recognizer for FakeRecognizer {
        fn start(&mut self) -> Result<()> {
            if self.fail_start {
                return Err(if self.fail_fatal {
                    CompaniaError::RecognizerUnavailable("no engine".into())
                } else {
                    CompaniaError::RecognizerError("busy".into())
                });
            }
            self.starts += 1;
            Ok(())
        }

        fn stop(&mut self) {
            self.stops += 1;
        }
    }

    fn engine() -> SpeechInputEngine<FakeRecognizer> {
        SpeechInputEngine::new(FakeRecognizer::default())
    }

    #[test]
    fn start_is_idempotent() {
        let mut eng = engine();
        eng.start();
        // Still in the starting phase: further calls are no-ops.
        eng.start();
        assert_eq!(eng.recognizer_mut().starts, 1);

        eng.on_started();
        eng.start();
        assert_eq!(eng.recognizer_mut().starts, 1);
        assert!(eng.is_active());
    }

    #[test]
    fn final_fragments_accumulate_and_rearm_debounce() {
        let mut eng = engine();
        let (gen1, delay) = eng.on_final("hola", false).unwrap();
        assert_eq!(delay, SILENCE_TO_SEND);
        let (gen2, _) = eng.on_final("qué tal", false).unwrap();
        assert!(gen2 > gen1);

        // The superseded timer does nothing.
        assert_eq!(eng.on_debounce(gen1), None);
        // The live one flushes the whole buffer.
        assert_eq!(eng.on_debounce(gen2), Some("hola qué tal".to_string()));
        assert_eq!(eng.pending_transcript(), "");
    }

    #[test]
    fn debounce_after_dispatch_is_empty() {
        let mut eng = engine();
        let (generation, _) = eng.on_final("hola", false).unwrap();
        assert!(eng.on_debounce(generation).is_some());
        assert_eq!(eng.on_debounce(generation), None);
    }

    #[test]
    fn results_during_narration_are_dropped() {
        let mut eng = engine();
        assert_eq!(eng.on_final("eco del asistente", true), None);
        assert_eq!(eng.pending_transcript(), "");
    }

    #[test]
    fn restart_only_when_idle_and_foreground() {
        let mut eng = engine();
        eng.on_started();
        assert_eq!(eng.on_ended(), Some(RESTART_RECOGNITION_DELAY));

        eng.on_restart_due(false);
        assert_eq!(eng.recognizer_mut().starts, 0);

        eng.set_foreground(false);
        eng.on_restart_due(true);
        assert_eq!(eng.recognizer_mut().starts, 0);

        eng.set_foreground(true);
        eng.on_restart_due(true);
        assert_eq!(eng.recognizer_mut().starts, 1);
    }

    #[test]
    fn fault_disables_without_rescheduling() {
        let mut eng = engine();
        eng.start();
        eng.on_started();
        eng.on_fault("not-allowed");
        assert!(eng.is_disabled());
        assert_eq!(eng.on_ended(), None);

        eng.on_restart_due(true);
        assert_eq!(eng.recognizer_mut().starts, 1);
    }

    #[test]
    fn fatal_start_error_disables_engine() {
        let mut eng = engine();
        eng.recognizer_mut().fail_start = true;
        eng.recognizer_mut().fail_fatal = true;
        eng.start();
        assert!(eng.is_disabled());

        // A recoverable failure leaves the engine available for retries.
        let mut eng = engine();
        eng.recognizer_mut().fail_start = true;
        eng.start();
        assert!(!eng.is_disabled());
    }
}
