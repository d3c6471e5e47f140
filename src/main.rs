use anyhow::Result;
use compania::coordinator::{self, AppConfig, Coordinator, CoreEvent};
use compania::device::DeviceStore;
use compania::net::{ApiClient, ConnectionSession, SessionEvent};
use compania::speech::{Recognizer, Synthesizer, Utterance};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Synthesizer stand-in for platforms without a native voice: reports each
/// segment as finished after an estimate of its speaking time. Stale
/// completions are filtered by session id downstream, so `cancel` has
/// nothing to undo.
struct TimedSynthesizer {
    events: mpsc::Sender<CoreEvent>,
}

impl Synthesizer for TimedSynthesizer {
    fn speak(&mut self, utterance: &Utterance) -> compania::Result<()> {
        let chars = utterance.text.chars().count() as u64;
        let per_char = (55.0 / utterance.rate.max(0.5)) as u64;
        let estimate = Duration::from_millis(300 + chars * per_char);
        info!(text = %utterance.text, ?estimate, "speaking");

        let events = self.events.clone();
        let session = utterance.session;
        tokio::spawn(async move {
            tokio::time::sleep(estimate).await;
            let _ = events.send(CoreEvent::SynthSegmentEnd { session }).await;
        });
        Ok(())
    }

    fn cancel(&mut self) {}
}

/// Recognizer stand-in: confirms lifecycle transitions but produces no
/// transcripts. A platform build replaces this with a real backend.
struct ChannelRecognizer {
    events: mpsc::Sender<CoreEvent>,
}

impl Recognizer for ChannelRecognizer {
    fn start(&mut self) -> compania::Result<()> {
        let _ = self.events.try_send(CoreEvent::RecognizerStarted);
        Ok(())
    }

    fn stop(&mut self) {
        let _ = self.events.try_send(CoreEvent::RecognizerEnded);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "compania=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = AppConfig::default();
    if let Ok(url) = std::env::var("COMPANIA_SERVER_URL") {
        config.server_url = url;
    }
    if let Ok(base) = std::env::var("COMPANIA_API_BASE") {
        config.api_base = base;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let store = DeviceStore::load_or_create(&config.device_file)?;
    info!(
        device_id = %store.device_id(),
        device_code = %store.device_code(),
        "device identity loaded"
    );

    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(256);

    // Socket task; its lifecycle and traffic become coordinator events.
    let (session_tx, mut session_rx) = mpsc::channel::<SessionEvent>(64);
    let (session, outbound, _state) =
        ConnectionSession::new(config.server_url.clone(), store.clone(), session_tx);
    tokio::spawn(session.run());
    let bridge_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = session_rx.recv().await {
            let core = match event {
                SessionEvent::Opened => CoreEvent::SessionOpened,
                SessionEvent::Closed => CoreEvent::SessionClosed,
                SessionEvent::Inbound(raw) => CoreEvent::Inbound { raw },
            };
            if bridge_tx.send(core).await.is_err() {
                break;
            }
        }
    });

    // Microphone metering, when built with audio support.
    #[cfg(feature = "audio-io")]
    let _capture = if config.enable_audio_input {
        start_capture(event_tx.clone())
    } else {
        None
    };

    let api = ApiClient::new(config.api_base.clone(), store.device_id())?;
    let synth = TimedSynthesizer {
        events: event_tx.clone(),
    };
    let recognizer = ChannelRecognizer {
        events: event_tx.clone(),
    };
    let coordinator = Coordinator::new(config, synth, recognizer, store);

    info!("coordinator running");
    coordinator::run(coordinator, event_rx, event_tx, outbound, api).await;
    Ok(())
}

#[cfg(feature = "audio-io")]
fn start_capture(
    event_tx: mpsc::Sender<CoreEvent>,
) -> Option<compania::audio::capture::AudioCapture> {
    use compania::audio::capture::{frame_channel, spawn_meter, AudioCapture};
    use tracing::warn;

    let mut capture = match AudioCapture::new() {
        Ok(capture) => capture,
        Err(e) => {
            warn!("voice input unavailable: {}", e);
            return None;
        }
    };
    let (frame_tx, frame_rx) = frame_channel(64);
    if let Err(e) = capture.start(frame_tx) {
        warn!("voice input unavailable: {}", e);
        return None;
    }
    spawn_meter(frame_rx, move |sample| {
        let _ = event_tx.try_send(CoreEvent::AudioLevel { rms: sample.rms });
    });
    Some(capture)
}
