//! Sequential narration of family messages.
//!
//! Messages are read aloud strictly in arrival order. Each one runs
//! through the full chain before the next starts: narrate, acknowledge
//! as read, wait out a short gap. A failed acknowledgement never stalls
//! the chain; after the last message a fixed closing remark is spoken.

use crate::messages::wire::FamilyMessage;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

/// Pause between consecutive messages.
pub const MESSAGE_GAP: Duration = Duration::from_millis(800);

/// Spoken once after the last message of a batch.
pub const CLOSING_REMARK: &str = "Esos son todos los mensajes. ¿En qué más puedo ayudarte?";

/// What the coordinator should do next with the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackAction {
    /// Narrate one message; `message_id` identifies the later read receipt.
    Narrate { text: String, message_id: i64 },
    /// The batch is drained; narrate the closing remark.
    Close,
}

/// FIFO queue of messages being read aloud.
pub struct MessagePlaybackQueue {
    queue: VecDeque<FamilyMessage>,
    current: Option<FamilyMessage>,
    playing: bool,
}

impl MessagePlaybackQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            playing: false,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Append a batch in arrival order.
    pub fn enqueue(&mut self, messages: Vec<FamilyMessage>) {
        debug!(count = messages.len(), "messages queued for narration");
        self.queue.extend(messages);
    }

    /// Begin draining the queue. No-op while a drain is already running
    /// or when nothing is queued.
    pub fn start(&mut self) -> Option<PlaybackAction> {
        if self.playing || self.queue.is_empty() {
            return None;
        }
        self.playing = true;
        self.advance()
    }

    fn advance(&mut self) -> Option<PlaybackAction> {
        match self.queue.pop_front() {
            Some(msg) => {
                let action = PlaybackAction::Narrate {
                    text: msg.narration(),
                    message_id: msg.id,
                };
                self.current = Some(msg);
                Some(action)
            }
            None => {
                self.playing = false;
                self.current = None;
                Some(PlaybackAction::Close)
            }
        }
    }

    /// The current message finished narrating. Returns the id to
    /// acknowledge as read.
    pub fn on_narrated(&mut self) -> Option<i64> {
        self.current.as_ref().map(|m| m.id)
    }

    /// The read receipt round-trip finished. Failures are logged and the
    /// chain continues regardless.
    pub fn on_ack_result(&mut self, message_id: i64, ok: bool) {
        if !ok {
            info!(message_id, "read receipt failed, continuing playback");
            return;
        }
        if let Some(current) = self.current.as_mut() {
            if current.id == message_id {
                current.read = true;
            }
        }
    }

    /// The inter-message gap elapsed; move to the next message or close.
    pub fn on_gap_elapsed(&mut self) -> Option<PlaybackAction> {
        if !self.playing {
            return None;
        }
        self.advance()
    }

    /// Barge-in or disconnect: abandon the rest of the batch.
    pub fn abort(&mut self) {
        if self.playing || !self.queue.is_empty() {
            info!(remaining = self.queue.len(), "message playback aborted");
        }
        self.queue.clear();
        self.current = None;
        self.playing = false;
    }
}

impl Default for MessagePlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64, sender: &str, body: &str) -> FamilyMessage {
        FamilyMessage {
            id,
            sender_name: Some(sender.to_string()),
            message: body.to_string(),
            timestamp: None,
            date: None,
            time: None,
            read: false,
        }
    }

    #[test]
    fn drains_in_arrival_order() {
        let mut q = MessagePlaybackQueue::new();
        q.enqueue(vec![msg(1, "Ana", "hola"), msg(2, "Luis", "adiós")]);

        assert_eq!(
            q.start(),
            Some(PlaybackAction::Narrate {
                text: "De Ana: hola".into(),
                message_id: 1
            })
        );
        assert_eq!(q.on_narrated(), Some(1));
        q.on_ack_result(1, true);

        assert_eq!(
            q.on_gap_elapsed(),
            Some(PlaybackAction::Narrate {
                text: "De Luis: adiós".into(),
                message_id: 2
            })
        );
        assert_eq!(q.on_narrated(), Some(2));
        q.on_ack_result(2, true);

        assert_eq!(q.on_gap_elapsed(), Some(PlaybackAction::Close));
        assert!(!q.is_playing());
    }

    #[test]
    fn failed_ack_does_not_stall_the_chain() {
        let mut q = MessagePlaybackQueue::new();
        q.enqueue(vec![msg(1, "Ana", "uno"), msg(2, "Ana", "dos")]);
        q.start();
        q.on_narrated();
        q.on_ack_result(1, false);

        match q.on_gap_elapsed() {
            Some(PlaybackAction::Narrate { message_id, .. }) => assert_eq!(message_id, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn start_is_idempotent_while_draining() {
        let mut q = MessagePlaybackQueue::new();
        q.enqueue(vec![msg(1, "Ana", "uno")]);
        assert!(q.start().is_some());
        assert_eq!(q.start(), None);
    }

    #[test]
    fn start_with_empty_queue_is_a_noop() {
        let mut q = MessagePlaybackQueue::new();
        assert_eq!(q.start(), None);
        assert!(!q.is_playing());
    }

    #[test]
    fn abort_drops_the_rest_of_the_batch() {
        let mut q = MessagePlaybackQueue::new();
        q.enqueue(vec![msg(1, "Ana", "uno"), msg(2, "Ana", "dos")]);
        q.start();
        q.abort();
        assert!(q.is_empty());
        assert!(!q.is_playing());
        assert_eq!(q.on_gap_elapsed(), None);
    }

    #[test]
    fn late_enqueue_extends_a_running_drain() {
        let mut q = MessagePlaybackQueue::new();
        q.enqueue(vec![msg(1, "Ana", "uno")]);
        q.start();
        q.enqueue(vec![msg(2, "Luis", "dos")]);
        q.on_narrated();
        q.on_ack_result(1, true);
        match q.on_gap_elapsed() {
            Some(PlaybackAction::Narrate { message_id, .. }) => assert_eq!(message_id, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
