//! Duplex server connection.
//!
//! One task owns the socket for the life of the process: connect, send
//! the identity handshake, pump frames, and on any failure tear down and
//! reconnect after a fixed delay. Outbound sends get one retry before
//! the frame is dropped and the socket is recycled.

use crate::device::DeviceStore;
use crate::messages::wire::ClientMessage;
use crate::{CompaniaError, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
pub const RECONNECT_DELAY: Duration = Duration::from_millis(1500);
pub const SEND_RETRY_DELAY: Duration = Duration::from_millis(600);

/// Socket lifecycle, for status display and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Connection lifecycle and traffic, delivered to the coordinator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opened,
    Inbound(String),
    Closed,
}

/// Owns the socket and its reconnect loop.
pub struct ConnectionSession {
    url: String,
    store: DeviceStore,
    events: mpsc::Sender<SessionEvent>,
    outbound: mpsc::Receiver<String>,
    state: Arc<RwLock<ConnectionState>>,
}

/// Cloneable handle for sending raw text frames.
pub type OutboundSender = mpsc::Sender<String>;

impl ConnectionSession {
    pub fn new(
        url: impl Into<String>,
        store: DeviceStore,
        events: mpsc::Sender<SessionEvent>,
    ) -> (Self, OutboundSender, Arc<RwLock<ConnectionState>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let state = Arc::new(RwLock::new(ConnectionState::Closed));
        let session = Self {
            url: url.into(),
            store,
            events,
            outbound: outbound_rx,
            state: state.clone(),
        };
        (session, outbound_tx, state)
    }

    /// Run until the coordinator side drops its channels.
    pub async fn run(mut self) {
        loop {
            *self.state.write() = ConnectionState::Connecting;
            match self.connect_once().await {
                Ok(ended) => {
                    if !ended {
                        // Coordinator hung up; we are shutting down.
                        return;
                    }
                }
                Err(e) => warn!("connection attempt failed: {}", e),
            }
            *self.state.write() = ConnectionState::Closed;
            if self.events.send(SessionEvent::Closed).await.is_err() {
                return;
            }
            if !self.drop_outbound_for(RECONNECT_DELAY).await {
                return;
            }
        }
    }

    /// Wait out the reconnect delay. Sends are at-most-once: a frame that
    /// shows up while the socket is down has already missed its retry
    /// window, so it is dropped rather than queued across reconnects.
    async fn drop_outbound_for(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                frame = self.outbound.recv() => match frame {
                    Some(_) => warn!("socket closed, outbound frame dropped"),
                    None => return false,
                },
            }
        }
    }

    /// One socket lifetime. Returns Ok(true) when the socket dropped and a
    /// reconnect should follow, Ok(false) on coordinator shutdown.
    async fn connect_once(&mut self) -> Result<bool> {
        info!(url = %self.url, "connecting");
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| CompaniaError::ConnectionError(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        // Identity handshake goes out before anything else.
        let hello = ClientMessage::InitialData {
            data: self.store.record(),
        };
        sink.send(Message::Text(hello.to_text()))
            .await
            .map_err(|e| CompaniaError::ConnectionError(e.to_string()))?;

        *self.state.write() = ConnectionState::Open;
        if self.events.send(SessionEvent::Opened).await.is_err() {
            return Ok(false);
        }

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.events.send(SessionEvent::Inbound(text)).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return Ok(true);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("socket closed by peer");
                        return Ok(true);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("socket read error: {}", e);
                        return Ok(true);
                    }
                },
                _ = keepalive.tick() => {
                    let frame = ClientMessage::Keepalive {
                        ts: Utc::now().timestamp_millis(),
                    }
                    .to_text();
                    if send_with_retry(&mut sink, frame).await.is_err() {
                        return Ok(true);
                    }
                }
                out = self.outbound.recv() => match out {
                    Some(text) => {
                        if send_with_retry(&mut sink, text).await.is_err() {
                            return Ok(true);
                        }
                    }
                    None => return Ok(false),
                }
            }
        }
    }
}

/// Send one text frame, retrying once after a short pause. On the second
/// failure the frame is dropped and the error recycles the socket.
async fn send_with_retry<S>(sink: &mut S, text: String) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    if sink.send(Message::Text(text.clone())).await.is_ok() {
        return Ok(());
    }
    warn!("send failed, retrying once");
    tokio::time::sleep(SEND_RETRY_DELAY).await;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| CompaniaError::ConnectionError(e.to_string()))
}
