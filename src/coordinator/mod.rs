//! Turn-taking arbitration and event orchestration.

pub mod config;
pub mod controller;
pub mod orchestrator;

pub use config::AppConfig;
pub use controller::{SpeechEndOutcome, SpeechStartOutcome, TurnState, TurnTakingController};
pub use orchestrator::{run, Coordinator, CoreEvent, HttpCall};
