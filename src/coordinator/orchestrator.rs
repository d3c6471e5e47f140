//! Event orchestration.
//!
//! Every signal in the system (audio levels, synthesizer callbacks,
//! recognizer lifecycle, socket traffic, timers, HTTP results) is funneled
//! into one [`CoreEvent`] stream and handled synchronously, one event at a
//! time. Timers and HTTP calls never call back directly: the handler
//! queues them as pending work, the async driver executes them and feeds
//! the results back in as events. State transitions therefore happen
//! whole, within a single `handle_event` call.

use crate::audio::monitor::{VadEvent, VoiceActivityMonitor};
use crate::coordinator::config::AppConfig;
use crate::coordinator::controller::{TurnState, TurnTakingController};
use crate::device::DeviceStore;
use crate::messages::playback::{MessagePlaybackQueue, PlaybackAction, CLOSING_REMARK, MESSAGE_GAP};
use crate::messages::wire::{
    classify_inbound, ClientMessage, FamilyInbox, InboundPayload, MemoryChest, ServerMessage,
};
use crate::net::api::ApiClient;
use crate::net::session::OutboundSender;
use crate::speech::input::{Recognizer, SpeechInputEngine};
use crate::speech::output::{NarrationStep, SpeechOutputEngine, Synthesizer};
use crate::Result;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything that can happen, as data.
#[derive(Debug)]
pub enum CoreEvent {
    /// One RMS level sample from the microphone meter.
    AudioLevel { rms: f32 },

    /// The synthesizer finished the current segment of `session`.
    SynthSegmentEnd { session: u64 },
    /// The synthesizer failed on the current segment of `session`.
    SynthSegmentError { session: u64 },
    /// The inter-segment pause for `session` elapsed.
    SegmentPauseElapsed { session: u64 },

    RecognizerStarted,
    RecognizerInterim { text: String },
    RecognizerFinal { text: String },
    RecognizerEnded,
    RecognizerFault { reason: String },
    /// The transcript debounce stamped with `generation` came due.
    TranscriptDebounce { generation: u64 },
    /// The scheduled recognizer restart came due.
    RecognizerRestartDue,

    SessionOpened,
    SessionClosed,
    /// One raw text frame from the server.
    Inbound { raw: String },

    /// The inter-message playback gap elapsed.
    PlaybackGapElapsed,
    /// A mark-as-read round-trip finished.
    ReadAckResult { message_id: i64, ok: bool },
    /// The periodic inbox poll came due.
    PollDue,
    InboxFetched { result: Result<FamilyInbox> },
    MemoryFetched { result: Result<MemoryChest> },

    ForegroundChanged { foreground: bool },
}

/// HTTP work queued by the handler for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpCall {
    FetchInbox,
    FetchMemory,
    MarkRead { message_id: i64 },
}

/// Why the live narration is being spoken; routes its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NarrationPurpose {
    /// A server response or plain text frame.
    ServerText,
    /// One family message out of the playback queue.
    PlaybackMessage,
    /// The fixed remark closing a playback batch.
    ClosingRemark,
    /// A local announcement (connection events and the like).
    Notice,
}

/// The single arbiter. Owns every component and all mutable state.
pub struct Coordinator<S: Synthesizer, R: Recognizer> {
    controller: TurnTakingController,
    monitor: VoiceActivityMonitor,
    output: SpeechOutputEngine<S>,
    input: SpeechInputEngine<R>,
    playback: MessagePlaybackQueue,
    store: DeviceStore,
    config: AppConfig,

    purpose: Option<NarrationPurpose>,
    first_open_seen: bool,

    pending_timers: Vec<(Duration, CoreEvent)>,
    pending_frames: Vec<String>,
    pending_http: Vec<HttpCall>,
}

impl<S: Synthesizer, R: Recognizer> Coordinator<S, R> {
    pub fn new(config: AppConfig, synth: S, recognizer: R, store: DeviceStore) -> Self {
        Self {
            controller: TurnTakingController::new(),
            monitor: VoiceActivityMonitor::new(config.vad.clone()),
            output: SpeechOutputEngine::new(synth, config.voice.clone()),
            input: SpeechInputEngine::new(recognizer),
            playback: MessagePlaybackQueue::new(),
            store,
            config,
            purpose: None,
            first_open_seen: false,
            pending_timers: Vec::new(),
            pending_frames: Vec::new(),
            pending_http: Vec::new(),
        }
    }

    pub fn turn_state(&self) -> TurnState {
        self.controller.state()
    }

    /// Drain the timers queued by the last `handle_event`.
    pub fn take_timers(&mut self) -> Vec<(Duration, CoreEvent)> {
        std::mem::take(&mut self.pending_timers)
    }

    /// Drain the outbound frames queued by the last `handle_event`.
    pub fn take_frames(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_frames)
    }

    /// Drain the HTTP calls queued by the last `handle_event`.
    pub fn take_http(&mut self) -> Vec<HttpCall> {
        std::mem::take(&mut self.pending_http)
    }

    /// Process one event to completion.
    pub fn handle_event(&mut self, event: CoreEvent, now: Instant) {
        match event {
            CoreEvent::AudioLevel { rms } => self.on_audio_level(rms, now),

            CoreEvent::SynthSegmentEnd { session } => {
                if let Some(pause) = self.output.segment_ended(session) {
                    self.schedule(pause, CoreEvent::SegmentPauseElapsed { session });
                }
            }
            CoreEvent::SegmentPauseElapsed { session } => {
                if self.output.advance(session) == NarrationStep::Completed {
                    self.finish_narration(session);
                }
            }
            CoreEvent::SynthSegmentError { session } => {
                if self.output.segment_failed(session) == NarrationStep::Completed {
                    self.finish_narration(session);
                }
            }

            CoreEvent::RecognizerStarted => self.input.on_started(),
            CoreEvent::RecognizerInterim { text } => self.input.on_interim(&text),
            CoreEvent::RecognizerFinal { text } => {
                let narrating = self.controller.state() == TurnState::AssistantSpeaking;
                if let Some((generation, delay)) = self.input.on_final(&text, narrating) {
                    self.schedule(delay, CoreEvent::TranscriptDebounce { generation });
                }
            }
            CoreEvent::TranscriptDebounce { generation } => {
                if let Some(transcript) = self.input.on_debounce(generation) {
                    info!(len = transcript.len(), "transcript dispatched");
                    // Recognized speech goes to the server as plain text.
                    self.pending_frames.push(transcript);
                }
            }
            CoreEvent::RecognizerEnded => {
                if let Some(delay) = self.input.on_ended() {
                    self.schedule(delay, CoreEvent::RecognizerRestartDue);
                }
            }
            CoreEvent::RecognizerRestartDue => {
                let idle = self.controller.state() == TurnState::Idle;
                self.input.on_restart_due(idle);
            }
            CoreEvent::RecognizerFault { reason } => self.input.on_fault(&reason),

            CoreEvent::SessionOpened => {
                info!("session open");
                self.input.start();
                if !self.first_open_seen {
                    self.first_open_seen = true;
                    self.schedule(self.config.startup_poll_delay, CoreEvent::PollDue);
                }
            }
            CoreEvent::SessionClosed => {
                // A broken socket mid-batch abandons the rest of the batch.
                self.playback.abort();
            }
            CoreEvent::Inbound { raw } => self.on_inbound(&raw),

            CoreEvent::PlaybackGapElapsed => {
                // The user may have taken the floor during the gap, with no
                // narration in flight to barge into. Hold the batch instead
                // of popping a message nobody will hear.
                if self.playback.is_playing() && self.controller.state() != TurnState::Idle {
                    self.schedule(MESSAGE_GAP, CoreEvent::PlaybackGapElapsed);
                } else if let Some(action) = self.playback.on_gap_elapsed() {
                    self.run_playback_action(action);
                }
            }
            CoreEvent::ReadAckResult { message_id, ok } => {
                self.playback.on_ack_result(message_id, ok);
                self.schedule(MESSAGE_GAP, CoreEvent::PlaybackGapElapsed);
            }
            CoreEvent::PollDue => {
                self.pending_http.push(HttpCall::FetchInbox);
                self.schedule(self.config.poll_interval, CoreEvent::PollDue);
            }
            CoreEvent::InboxFetched { result } => match result {
                Ok(inbox) => self.on_inbox(inbox),
                Err(e) => warn!("inbox fetch failed: {}", e),
            },
            CoreEvent::MemoryFetched { result } => match result {
                Ok(chest) => {
                    debug!(memories = chest.important_memories.len(), "memory chest updated")
                }
                Err(e) => {
                    warn!("memory fetch failed: {}", e);
                    let notice = e.user_message();
                    self.narrate(&notice, NarrationPurpose::Notice);
                }
            },

            CoreEvent::ForegroundChanged { foreground } => {
                self.input.set_foreground(foreground);
                if !foreground {
                    self.input.stop();
                }
            }
        }
    }

    fn schedule(&mut self, delay: Duration, event: CoreEvent) {
        self.pending_timers.push((delay, event));
    }

    fn on_audio_level(&mut self, rms: f32, now: Instant) {
        match self.monitor.on_level(rms, now) {
            Some(VadEvent::SpeechStart) => {
                let outcome = self.controller.notify_speech_start();
                if outcome.interrupted_narration {
                    self.output.interrupt();
                    self.purpose = None;
                    self.playback.abort();
                    // The recognizer was stopped for the narration; bring it
                    // back so the interruption is heard.
                    self.input.start();
                }
            }
            Some(VadEvent::SpeechEnd) => {
                let outcome = self.controller.notify_speech_end();
                if outcome.resume_listening {
                    self.input.start();
                    // A batch that arrived while the user was talking can
                    // finally begin.
                    if let Some(action) = self.playback.start() {
                        self.run_playback_action(action);
                    }
                }
            }
            None => {}
        }
    }

    /// Ask the floor for a narration and begin it.
    fn narrate(&mut self, text: &str, purpose: NarrationPurpose) {
        let suppress_repeats =
            matches!(purpose, NarrationPurpose::ServerText | NarrationPurpose::Notice);
        if suppress_repeats && self.output.is_duplicate(text) {
            debug!("duplicate narration suppressed");
            return;
        }
        let Some(session) = self.controller.request_narration() else {
            debug!("narration dropped: user is talking");
            return;
        };
        self.input.stop();
        self.purpose = Some(purpose);
        if self.output.begin(text, session) == NarrationStep::Completed {
            self.finish_narration(session);
        }
    }

    /// The narration under `session` ran out of segments.
    fn finish_narration(&mut self, session: u64) {
        if !self.controller.narration_complete(session) {
            return;
        }
        let purpose = self.purpose.take();
        self.input.start();

        match purpose {
            Some(NarrationPurpose::PlaybackMessage) => {
                if let Some(message_id) = self.playback.on_narrated() {
                    self.pending_http.push(HttpCall::MarkRead { message_id });
                }
            }
            _ => {
                // Any other completion may have been holding back a queued
                // batch of family messages.
                if let Some(action) = self.playback.start() {
                    self.run_playback_action(action);
                }
            }
        }
    }

    fn run_playback_action(&mut self, action: PlaybackAction) {
        match action {
            PlaybackAction::Narrate { text, .. } => {
                self.narrate(&text, NarrationPurpose::PlaybackMessage)
            }
            PlaybackAction::Close => self.narrate(CLOSING_REMARK, NarrationPurpose::ClosingRemark),
        }
    }

    fn on_inbound(&mut self, raw: &str) {
        match classify_inbound(raw) {
            InboundPayload::PlainText(text) => self.narrate(&text, NarrationPurpose::ServerText),
            InboundPayload::Unrecognized(_) => {}
            InboundPayload::Structured(msg) => self.on_server_message(msg),
        }
    }

    fn on_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Message {
                text,
                has_family_messages,
                messages,
            } => {
                if has_family_messages.unwrap_or(false) {
                    if let Some(batch) = messages {
                        self.playback.enqueue(batch);
                    }
                }
                if let Some(t) = text.filter(|t| !t.trim().is_empty()) {
                    // Playback waits for this narration to finish.
                    self.narrate(&t, NarrationPurpose::ServerText);
                }
                // A suppressed or absent announcement leaves the floor free
                // with no completion coming; the batch starts here instead.
                if self.controller.state() == TurnState::Idle {
                    if let Some(action) = self.playback.start() {
                        self.run_playback_action(action);
                    }
                }
            }
            ServerMessage::FamilyMessagesToRead { messages } => {
                self.playback.enqueue(messages);
                if let Some(action) = self.playback.start() {
                    self.run_playback_action(action);
                }
            }
            ServerMessage::NewMessageNotification => {
                self.pending_http.push(HttpCall::FetchInbox);
            }
            ServerMessage::ConnectionRequest {
                request_id,
                user_info,
            } => {
                // Headless operation: pairing requests are accepted and the
                // new contact is announced aloud.
                let name = user_info.display_name().to_string();
                info!(request_id = %request_id, name = %name, "connection request accepted");
                let response = ClientMessage::ConnectionResponse {
                    request_id,
                    approved: true,
                };
                self.pending_frames.push(response.to_text());
                self.narrate(
                    &format!("{} se ha conectado contigo.", name),
                    NarrationPurpose::Notice,
                );
            }
            ServerMessage::ConnectionApproved { user_name, chat_id } => {
                if let Err(e) = self.store.set_connected_chat(chat_id) {
                    warn!("connected chat not persisted: {}", e);
                }
                self.narrate(
                    &format!("Conectado con {}.", user_name),
                    NarrationPurpose::Notice,
                );
            }
            ServerMessage::DeviceInfo {
                device_id,
                device_code,
                connected_chat,
            } => {
                debug!(%device_id, %device_code, "device info from server");
                if let Err(e) =
                    self.store
                        .adopt_identity(&device_id, &device_code, connected_chat)
                {
                    warn!("device identity not persisted: {}", e);
                }
            }
            ServerMessage::DataUpdate {
                user_memory,
                conversation_history,
            } => {
                if let Err(e) = self.store.apply_update(user_memory, conversation_history) {
                    warn!("data update not persisted: {}", e);
                }
            }
            ServerMessage::MemorySaved => {
                self.pending_http.push(HttpCall::FetchMemory);
                self.narrate("He guardado ese recuerdo.", NarrationPurpose::Notice);
            }
            ServerMessage::Ping { .. } => {
                self.pending_frames.push(r#"{"type":"pong"}"#.to_string());
            }
            ServerMessage::Pong { .. } => {}
        }
    }

    fn on_inbox(&mut self, inbox: FamilyInbox) {
        let unread: Vec<_> = inbox.all_messages.into_iter().filter(|m| !m.read).collect();
        if unread.is_empty() {
            return;
        }
        let count = unread.len();
        info!(count, "unread messages to narrate");
        self.playback.enqueue(unread);

        let notice = if count == 1 {
            "Tienes un mensaje nuevo.".to_string()
        } else {
            format!("Tienes {} mensajes nuevos.", count)
        };
        self.narrate(&notice, NarrationPurpose::Notice);
        // If the notice was suppressed or denied, the batch still starts
        // as soon as the floor is free.
        if self.controller.state() == TurnState::Idle {
            if let Some(action) = self.playback.start() {
                self.run_playback_action(action);
            }
        }
    }
}

/// Drive a [`Coordinator`] from an event channel, executing the work it
/// queues: timers become delayed re-injections, frames go to the socket,
/// HTTP calls come back as result events.
pub async fn run<S, R>(
    mut coordinator: Coordinator<S, R>,
    mut events: mpsc::Receiver<CoreEvent>,
    event_tx: mpsc::Sender<CoreEvent>,
    outbound: OutboundSender,
    api: ApiClient,
) where
    S: Synthesizer + Send + 'static,
    R: Recognizer + Send + 'static,
{
    while let Some(event) = events.recv().await {
        coordinator.handle_event(event, Instant::now());

        for (delay, event) in coordinator.take_timers() {
            let tx = event_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(event).await;
            });
        }

        for frame in coordinator.take_frames() {
            if outbound.send(frame).await.is_err() {
                warn!("outbound channel closed");
            }
        }

        for call in coordinator.take_http() {
            let tx = event_tx.clone();
            let api = api.clone();
            tokio::spawn(async move {
                match call {
                    HttpCall::FetchInbox => {
                        let result = api.fetch_family_messages().await;
                        let _ = tx.send(CoreEvent::InboxFetched { result }).await;
                    }
                    HttpCall::FetchMemory => {
                        let result = api.fetch_memory_chest().await;
                        let _ = tx.send(CoreEvent::MemoryFetched { result }).await;
                    }
                    HttpCall::MarkRead { message_id } => {
                        let ok = api.mark_message_read(message_id).await.is_ok();
                        let _ = tx.send(CoreEvent::ReadAckResult { message_id, ok }).await;
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::output::Utterance;

    #[derive(Default)]
    struct FakeSynth {
        spoken: Vec<String>,
        cancels: usize,
    }

    impl Synthesizer for FakeSynth {
        fn speak(&mut self, utterance: &Utterance) -> Result<()> {
            self.spoken.push(utterance.text.clone());
            Ok(())
        }

        fn cancel(&mut self) {
            self.cancels += 1;
        }
    }

    #[derive(Default)]
    struct FakeRecognizer {
        starts: usize,
        stops: usize,
    }

    impl Recognizer for FakeRecognizer {
        fn start(&mut self) -> Result<()> {
            self.starts += 1;
            Ok(())
        }

        fn stop(&mut self) {
            self.stops += 1;
        }
    }

    fn coordinator() -> (Coordinator<FakeSynth, FakeRecognizer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::load_or_create(dir.path().join("device.json")).unwrap();
        let co = Coordinator::new(
            AppConfig::default(),
            FakeSynth::default(),
            FakeRecognizer::default(),
            store,
        );
        (co, dir)
    }

    fn spoken(co: &mut Coordinator<FakeSynth, FakeRecognizer>) -> Vec<String> {
        co.output.synth_mut().spoken.clone()
    }

    /// Narrate the live session to completion by replaying the synth and
    /// timer callbacks the driver would deliver.
    fn drain_narration(co: &mut Coordinator<FakeSynth, FakeRecognizer>, now: Instant) {
        let session = co.controller.current_session();
        for _ in 0..64 {
            if co.controller.state() != TurnState::AssistantSpeaking
                || !co.controller.is_current(session)
            {
                return;
            }
            co.handle_event(CoreEvent::SynthSegmentEnd { session }, now);
            co.handle_event(CoreEvent::SegmentPauseElapsed { session }, now);
        }
        panic!("narration did not complete");
    }

    #[test]
    fn plain_text_frame_is_narrated() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        co.handle_event(
            CoreEvent::Inbound {
                raw: "Hola. ¿Qué tal?".into(),
            },
            now,
        );
        assert_eq!(co.turn_state(), TurnState::AssistantSpeaking);
        assert_eq!(spoken(&mut co), vec!["Hola.".to_string()]);

        drain_narration(&mut co, now);
        assert_eq!(co.turn_state(), TurnState::Idle);
        assert_eq!(spoken(&mut co), vec!["Hola.".to_string(), "¿Qué tal?".to_string()]);
    }

    #[test]
    fn barge_in_cancels_narration_within_one_event() {
        let (mut co, _dir) = coordinator();
        let mut now = Instant::now();
        co.handle_event(
            CoreEvent::Inbound {
                raw: "Una respuesta bastante larga. Con varias frases.".into(),
            },
            now,
        );
        let session = co.controller.current_session();

        // Loud input long enough to cross the onset threshold.
        for _ in 0..30 {
            now += Duration::from_millis(10);
            co.handle_event(CoreEvent::AudioLevel { rms: 0.5 }, now);
        }
        assert_eq!(co.turn_state(), TurnState::UserSpeaking);
        assert!(co.output.synth_mut().cancels > 0);

        // The superseded narration's callbacks do nothing.
        let before = spoken(&mut co).len();
        co.handle_event(CoreEvent::SynthSegmentEnd { session }, now);
        co.handle_event(CoreEvent::SegmentPauseElapsed { session }, now);
        assert_eq!(spoken(&mut co).len(), before);
        assert_eq!(co.turn_state(), TurnState::UserSpeaking);
    }

    #[test]
    fn narration_denied_while_user_talks() {
        let (mut co, _dir) = coordinator();
        let mut now = Instant::now();
        for _ in 0..30 {
            now += Duration::from_millis(10);
            co.handle_event(CoreEvent::AudioLevel { rms: 0.5 }, now);
        }
        assert_eq!(co.turn_state(), TurnState::UserSpeaking);

        co.handle_event(CoreEvent::Inbound { raw: "Hola.".into() }, now);
        assert!(spoken(&mut co).is_empty());
        assert_eq!(co.turn_state(), TurnState::UserSpeaking);
    }

    #[test]
    fn transcript_debounce_sends_plain_text() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        co.handle_event(
            CoreEvent::RecognizerFinal {
                text: "hola".into(),
            },
            now,
        );
        co.handle_event(
            CoreEvent::RecognizerFinal {
                text: "qué tal".into(),
            },
            now,
        );
        let timers = co.take_timers();
        let generation = timers
            .iter()
            .filter_map(|(_, e)| match e {
                CoreEvent::TranscriptDebounce { generation } => Some(*generation),
                _ => None,
            })
            .max()
            .unwrap();

        co.handle_event(CoreEvent::TranscriptDebounce { generation }, now);
        assert_eq!(co.take_frames(), vec!["hola qué tal".to_string()]);
    }

    #[test]
    fn finals_during_narration_are_dropped() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        co.handle_event(CoreEvent::Inbound { raw: "Hola.".into() }, now);
        co.take_timers();

        co.handle_event(
            CoreEvent::RecognizerFinal {
                text: "eco".into(),
            },
            now,
        );
        assert!(co.take_timers().is_empty());
        assert_eq!(co.input.pending_transcript(), "");
    }

    #[test]
    fn playback_chain_survives_failed_ack() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        let raw = r#"{
            "type": "message",
            "has_family_messages": true,
            "messages": [
                {"id": 1, "sender_name": "Ana", "message": "Uno.", "read": false},
                {"id": 2, "sender_name": "Ana", "message": "Dos.", "read": false},
                {"id": 3, "sender_name": "Ana", "message": "Tres.", "read": false}
            ]
        }"#;
        co.handle_event(CoreEvent::Inbound { raw: raw.into() }, now);

        for id in 1..=3i64 {
            assert!(spoken(&mut co).last().unwrap().contains("De Ana:"));
            drain_narration(&mut co, now);
            assert!(co.take_http().contains(&HttpCall::MarkRead { message_id: id }));
            // The second receipt fails; playback continues regardless.
            co.handle_event(
                CoreEvent::ReadAckResult {
                    message_id: id,
                    ok: id != 2,
                },
                now,
            );
            co.handle_event(CoreEvent::PlaybackGapElapsed, now);
        }

        // The closing remark follows the last message.
        assert_eq!(spoken(&mut co).last().unwrap(), "Esos son todos los mensajes.");
        drain_narration(&mut co, now);
        assert_eq!(co.turn_state(), TurnState::Idle);
    }

    #[test]
    fn gap_elapsing_during_user_speech_holds_the_batch() {
        let (mut co, _dir) = coordinator();
        let mut now = Instant::now();
        let raw = r#"{
            "type": "family_messages_to_read",
            "messages": [
                {"id": 1, "sender_name": "Ana", "message": "Uno.", "read": false},
                {"id": 2, "sender_name": "Ana", "message": "Dos.", "read": false}
            ]
        }"#;
        co.handle_event(CoreEvent::Inbound { raw: raw.into() }, now);
        drain_narration(&mut co, now);
        co.handle_event(
            CoreEvent::ReadAckResult {
                message_id: 1,
                ok: true,
            },
            now,
        );
        co.take_timers();

        // The user speaks up during the gap; nothing is narrating, so no
        // barge-in abort runs.
        for _ in 0..30 {
            now += Duration::from_millis(10);
            co.handle_event(CoreEvent::AudioLevel { rms: 0.5 }, now);
        }
        assert_eq!(co.turn_state(), TurnState::UserSpeaking);

        co.handle_event(CoreEvent::PlaybackGapElapsed, now);
        assert_eq!(spoken(&mut co).last().unwrap(), "De Ana: Uno.");
        // The gap rearms instead of popping the message.
        assert!(co
            .take_timers()
            .iter()
            .any(|(d, e)| matches!(e, CoreEvent::PlaybackGapElapsed) && *d == MESSAGE_GAP));

        for _ in 0..450 {
            now += Duration::from_millis(10);
            co.handle_event(CoreEvent::AudioLevel { rms: 0.01 }, now);
        }
        assert_eq!(co.turn_state(), TurnState::Idle);

        co.handle_event(CoreEvent::PlaybackGapElapsed, now);
        assert_eq!(spoken(&mut co).last().unwrap(), "De Ana: Dos.");
    }

    #[test]
    fn suppressed_announcement_still_starts_the_batch() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        co.handle_event(CoreEvent::Inbound { raw: "Hola.".into() }, now);
        drain_narration(&mut co, now);

        // Same announcement text again, this time carrying messages: the
        // repeat is suppressed but the batch must not be stranded.
        let raw = r#"{
            "type": "message",
            "text": "Hola.",
            "has_family_messages": true,
            "messages": [{"id": 4, "sender_name": "Ana", "message": "Nuevo.", "read": false}]
        }"#;
        co.handle_event(CoreEvent::Inbound { raw: raw.into() }, now);
        assert_eq!(spoken(&mut co).last().unwrap(), "De Ana: Nuevo.");
    }

    #[test]
    fn server_text_defers_playback_until_narrated() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        let raw = r#"{
            "type": "message",
            "text": "Tienes un mensaje.",
            "has_family_messages": true,
            "messages": [{"id": 9, "sender_name": "Luis", "message": "Hola.", "read": false}]
        }"#;
        co.handle_event(CoreEvent::Inbound { raw: raw.into() }, now);
        assert_eq!(spoken(&mut co), vec!["Tienes un mensaje.".to_string()]);

        drain_narration(&mut co, now);
        assert_eq!(spoken(&mut co).last().unwrap(), "De Luis: Hola.");
    }

    #[test]
    fn restart_due_respects_the_floor() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        co.handle_event(CoreEvent::Inbound { raw: "Hola.".into() }, now);
        let starts_before = co.input.recognizer_mut().starts;

        co.handle_event(CoreEvent::RecognizerRestartDue, now);
        assert_eq!(co.input.recognizer_mut().starts, starts_before);

        drain_narration(&mut co, now);
        co.handle_event(CoreEvent::RecognizerRestartDue, now);
        assert!(co.input.recognizer_mut().starts > starts_before);
    }

    #[test]
    fn duplicate_server_text_is_suppressed() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        co.handle_event(CoreEvent::Inbound { raw: "Hola.".into() }, now);
        drain_narration(&mut co, now);

        co.handle_event(CoreEvent::Inbound { raw: "Hola.".into() }, now);
        assert_eq!(co.turn_state(), TurnState::Idle);
        assert_eq!(spoken(&mut co).len(), 1);
    }

    #[test]
    fn notification_triggers_inbox_fetch_and_poll_reschedules() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        co.handle_event(
            CoreEvent::Inbound {
                raw: r#"{"type": "new_message_notification"}"#.into(),
            },
            now,
        );
        assert_eq!(co.take_http(), vec![HttpCall::FetchInbox]);

        co.handle_event(CoreEvent::PollDue, now);
        assert_eq!(co.take_http(), vec![HttpCall::FetchInbox]);
        let timers = co.take_timers();
        assert!(timers
            .iter()
            .any(|(d, e)| matches!(e, CoreEvent::PollDue) && *d == Duration::from_secs(120)));
    }

    #[test]
    fn connection_request_is_answered_and_announced() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        let raw = r#"{
            "type": "connection_request",
            "request_id": "r1",
            "user_info": {"user_full_name": "María"}
        }"#;
        co.handle_event(CoreEvent::Inbound { raw: raw.into() }, now);

        let frames = co.take_frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("connection_response"));
        assert!(frames[0].contains("\"approved\":true"));
        assert_eq!(spoken(&mut co).last().unwrap(), "María se ha conectado contigo.");
    }

    #[test]
    fn data_update_persists_without_touching_identity() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        let id = co.store.device_id();
        let raw = r#"{"type": "data_update", "user_memory": {"nombre": "Carmen"}, "conversation_history": []}"#;
        co.handle_event(CoreEvent::Inbound { raw: raw.into() }, now);

        let record = co.store.record();
        assert_eq!(record.device_id, id);
        assert_eq!(record.user_memory["nombre"], "Carmen");
    }

    #[test]
    fn inbox_results_queue_only_unread() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        let inbox: FamilyInbox = serde_json::from_str(
            r#"{"all_messages": [
                {"id": 1, "sender_name": "Ana", "message": "Viejo.", "read": true},
                {"id": 2, "sender_name": "Ana", "message": "Nuevo.", "read": false}
            ]}"#,
        )
        .unwrap();
        co.handle_event(CoreEvent::InboxFetched { result: Ok(inbox) }, now);
        assert_eq!(spoken(&mut co), vec!["Tienes un mensaje nuevo.".to_string()]);

        // The batch follows the announcement; read messages never narrate.
        drain_narration(&mut co, now);
        assert_eq!(spoken(&mut co).last().unwrap(), "De Ana: Nuevo.");
        assert!(!spoken(&mut co).contains(&"De Ana: Viejo.".to_string()));
    }

    #[test]
    fn session_open_schedules_startup_poll_once() {
        let (mut co, _dir) = coordinator();
        let now = Instant::now();
        co.handle_event(CoreEvent::SessionOpened, now);
        assert!(co
            .take_timers()
            .iter()
            .any(|(d, e)| matches!(e, CoreEvent::PollDue) && *d == Duration::from_secs(2)));

        co.handle_event(CoreEvent::SessionClosed, now);
        co.handle_event(CoreEvent::SessionOpened, now);
        assert!(co.take_timers().is_empty());
    }

    #[test]
    fn ping_frames_get_a_pong() {
        let (mut co, _dir) = coordinator();
        co.handle_event(
            CoreEvent::Inbound {
                raw: r#"{"type": "ping", "ts": 1}"#.into(),
            },
            Instant::now(),
        );
        assert_eq!(co.take_frames(), vec![r#"{"type":"pong"}"#.to_string()]);
    }
}
