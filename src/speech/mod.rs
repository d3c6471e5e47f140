//! Speech engines: narration output and recognition input.

pub mod input;
pub mod output;

pub use input::{Recognizer, SpeechInputEngine, RESTART_RECOGNITION_DELAY, SILENCE_TO_SEND};
pub use output::{
    segment_narration, NarrationStep, SpeechOutputEngine, Synthesizer, Utterance, VoiceParams,
};
