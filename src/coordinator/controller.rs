//! Turn-taking arbitration.
//!
//! Exactly one party holds the floor at any moment. Every other component
//! asks this controller before speaking or listening; none of them keep
//! their own notion of who is talking. The user always wins: speech
//! detected during narration invalidates the live speech session
//! immediately, with no debounce.

use tracing::{debug, info};

/// Who currently holds the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AssistantSpeaking,
    UserSpeaking,
}

/// Result of reporting user speech onset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechStartOutcome {
    /// An in-flight narration was invalidated and the synthesizer must be
    /// cancelled (barge-in).
    pub interrupted_narration: bool,
}

/// Result of reporting end of user speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechEndOutcome {
    /// Recognition should be (re)started now.
    pub resume_listening: bool,
}

/// Owner of [`TurnState`] and the speech session counter.
///
/// The session counter is the sole cancellation mechanism for narration:
/// continuations captured under an older session id are no-ops.
pub struct TurnTakingController {
    state: TurnState,
    session: u64,
}

impl TurnTakingController {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            session: 0,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// The id of the only speech session allowed to emit audio.
    pub fn current_session(&self) -> u64 {
        self.session
    }

    /// Whether a captured session id still identifies the live session.
    pub fn is_current(&self, session: u64) -> bool {
        session == self.session
    }

    /// The user started talking. Always wins immediately.
    pub fn notify_speech_start(&mut self) -> SpeechStartOutcome {
        let interrupted = self.state == TurnState::AssistantSpeaking;
        if interrupted {
            // Invalidate the live narration; its pending continuations
            // become no-ops.
            self.session += 1;
            info!("barge-in: user interrupted narration");
        }
        self.state = TurnState::UserSpeaking;
        SpeechStartOutcome {
            interrupted_narration: interrupted,
        }
    }

    /// The user reliably stopped talking.
    pub fn notify_speech_end(&mut self) -> SpeechEndOutcome {
        if self.state == TurnState::UserSpeaking {
            self.state = TurnState::Idle;
        }
        debug!("user turn ended");
        SpeechEndOutcome {
            resume_listening: self.state == TurnState::Idle,
        }
    }

    /// Ask to narrate. Granted only while the user is not talking; the
    /// returned session id stamps every continuation of this narration.
    pub fn request_narration(&mut self) -> Option<u64> {
        if self.state == TurnState::UserSpeaking {
            debug!("narration request denied: user is talking");
            return None;
        }
        self.session += 1;
        self.state = TurnState::AssistantSpeaking;
        Some(self.session)
    }

    /// Narration under `session` ran to completion. Stale sessions are
    /// ignored: if the user barged in, the transition already happened.
    ///
    /// Returns true when the floor was actually released.
    pub fn narration_complete(&mut self, session: u64) -> bool {
        if !self.is_current(session) {
            debug!(session, current = self.session, "stale narration completion");
            return false;
        }
        if self.state != TurnState::AssistantSpeaking {
            return false;
        }
        self.state = TurnState::Idle;
        true
    }
}

impl Default for TurnTakingController {
    fn default() -> Self {
        Self::new()
    }
}
