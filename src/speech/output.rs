//! Narration: text segmentation and synthesizer control.
//!
//! Text is narrated as a chain of short utterances so the synthesizer can
//! be cancelled between segments. The engine never owns the decision to
//! speak; the coordinator grants it a session id and every continuation
//! (next segment, inter-segment pause) is validated against that id before
//! it runs.

use crate::Result;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest piece produced by sentence/comma splitting.
const MAX_SEGMENT_CHARS: usize = 120;
/// Slice width for hard-chunking oversized pieces.
const HARD_CHUNK_CHARS: usize = 110;
/// Inter-segment pause range.
const PAUSE_MIN_MS: u64 = 360;
const PAUSE_JITTER_MS: u64 = 120;

/// Synthesizer voice settings.
#[derive(Debug, Clone)]
pub struct VoiceParams {
    pub volume: f32,
    pub rate: f32,
    pub pitch: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            volume: 0.95,
            rate: 0.90,
            pitch: 0.92,
        }
    }
}

/// One utterance handed to the synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub volume: f32,
    pub rate: f32,
    pub pitch: f32,
    /// Live session id; the adapter echoes it in completion events.
    pub session: u64,
}

/// Text-to-speech engine seam. The platform adapter reports segment
/// completion and failure back to the coordinator as events.
pub trait Synthesizer {
    fn speak(&mut self, utterance: &Utterance) -> Result<()>;
    fn cancel(&mut self);
}

/// Split narration text into synthesizer-sized segments.
///
/// Sentence boundaries first; any piece over 120 characters is re-split on
/// commas; anything still too long is hard-chunked into ≤110-character
/// slices. Counts are characters, not bytes.
pub fn segment_narration(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    for sentence in split_sentences(text) {
        push_piece(&mut segments, &sentence);
    }
    segments
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().map_or(true, |n| n.is_whitespace()) {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    out
}

fn push_piece(segments: &mut Vec<String>, piece: &str) {
    if piece.chars().count() <= MAX_SEGMENT_CHARS {
        segments.push(piece.to_string());
        return;
    }
    for part in piece.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.chars().count() <= MAX_SEGMENT_CHARS {
            segments.push(part.to_string());
        } else {
            let chars: Vec<char> = part.chars().collect();
            for chunk in chars.chunks(HARD_CHUNK_CHARS) {
                let slice: String = chunk.iter().collect();
                let slice = slice.trim();
                if !slice.is_empty() {
                    segments.push(slice.to_string());
                }
            }
        }
    }
}

/// Outcome of advancing the narration by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrationStep {
    /// A segment was handed to the synthesizer.
    Spoke,
    /// The last segment finished; the narration is complete.
    Completed,
    /// The captured session no longer matches; nothing happened.
    Stale,
}

/// Drives a [`Synthesizer`] through the segments of one narration at a
/// time, last-writer-wins across sessions.
pub struct SpeechOutputEngine<S: Synthesizer> {
    synth: S,
    voice: VoiceParams,
    segments: Vec<String>,
    index: usize,
    session: u64,
    last_spoken: Option<String>,
    active: bool,
}

impl<S: Synthesizer> SpeechOutputEngine<S> {
    pub fn new(synth: S, voice: VoiceParams) -> Self {
        Self {
            synth,
            voice,
            segments: Vec::new(),
            index: 0,
            session: 0,
            last_spoken: None,
            active: false,
        }
    }

    /// Duplicate-suppression check; the coordinator consults this before
    /// allocating a session so repeats never consume one.
    pub fn is_duplicate(&self, text: &str) -> bool {
        self.last_spoken.as_deref() == Some(text)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Begin narrating `text` under `session`, cancelling any in-flight
    /// synthesis. Returns `Completed` when the text yields no segments.
    pub fn begin(&mut self, text: &str, session: u64) -> NarrationStep {
        self.synth.cancel();
        self.segments = segment_narration(text);
        self.index = 0;
        self.session = session;
        self.last_spoken = Some(text.to_string());

        if self.segments.is_empty() {
            self.active = false;
            return NarrationStep::Completed;
        }
        self.active = true;
        self.speak_current();
        NarrationStep::Spoke
    }

    /// The synthesizer finished the current segment. Returns the pause to
    /// wait before the next one, or None if the session is stale or the
    /// narration just completed (completion is reported by the following
    /// `advance`).
    pub fn segment_ended(&mut self, session: u64) -> Option<Duration> {
        if !self.active || session != self.session {
            debug!(session, "ignoring stale segment completion");
            return None;
        }
        let jitter = rand::thread_rng().gen_range(0..PAUSE_JITTER_MS);
        Some(Duration::from_millis(PAUSE_MIN_MS + jitter))
    }

    /// Move past the current segment: speak the next one or finish.
    pub fn advance(&mut self, session: u64) -> NarrationStep {
        if !self.active || session != self.session {
            return NarrationStep::Stale;
        }
        self.index += 1;
        if self.index >= self.segments.len() {
            self.active = false;
            return NarrationStep::Completed;
        }
        self.speak_current();
        NarrationStep::Spoke
    }

    /// A segment failed in the synthesizer: skip straight to the next.
    pub fn segment_failed(&mut self, session: u64) -> NarrationStep {
        if !self.active || session != self.session {
            return NarrationStep::Stale;
        }
        warn!(segment = self.index, "synthesizer error, skipping segment");
        self.advance(session)
    }

    /// Barge-in: cancel synthesis and drop the narration. The duplicate
    /// guard is cleared so the interrupted text can be spoken again later.
    pub fn interrupt(&mut self) {
        self.synth.cancel();
        self.active = false;
        self.last_spoken = None;
    }

    fn speak_current(&mut self) {
        let text = &self.segments[self.index];
        // Alternate the rate a touch per segment so the cadence is not
        // perfectly uniform.
        let variation = if self.index % 2 == 0 { 0.98 } else { 1.02 };
        let utterance = Utterance {
            text: text.clone(),
            volume: self.voice.volume,
            rate: (self.voice.rate * variation).clamp(0.5, 2.0),
            pitch: self.voice.pitch,
            session: self.session,
        };
        if let Err(e) = self.synth.speak(&utterance) {
            warn!("speak failed: {}", e);
        }
    }

    pub fn synth_mut(&mut self) -> &mut S {
        &mut self.synth
    }
}
