//! JSON wire types for the duplex channel and the HTTP API.

use crate::device::DeviceRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// One family message, owned by the client once fetched. `read` flips only
/// after the server acknowledges the mark-as-read call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyMessage {
    pub id: i64,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub read: bool,
}

impl FamilyMessage {
    pub fn sender(&self) -> &str {
        self.sender_name.as_deref().unwrap_or("un familiar")
    }

    /// The sentence narrated aloud for this message.
    pub fn narration(&self) -> String {
        format!("De {}: {}", self.sender(), self.message)
    }
}

/// Identity of a person asking to connect to this device.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub user_full_name: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub chat_id: Option<i64>,
}

impl UserInfo {
    pub fn display_name(&self) -> &str {
        self.user_full_name
            .as_deref()
            .or(self.user_name.as_deref())
            .unwrap_or("Alguien")
    }
}

/// Structured message kinds received over the duplex channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        has_family_messages: Option<bool>,
        #[serde(default)]
        messages: Option<Vec<FamilyMessage>>,
    },

    /// Legacy batch format, still emitted by older servers.
    #[serde(rename = "family_messages_to_read")]
    FamilyMessagesToRead { messages: Vec<FamilyMessage> },

    /// Silent trigger: re-poll the inbox, narrate nothing directly.
    #[serde(rename = "new_message_notification")]
    NewMessageNotification,

    #[serde(rename = "connection_request")]
    ConnectionRequest {
        request_id: String,
        user_info: UserInfo,
    },

    #[serde(rename = "connection_approved")]
    ConnectionApproved {
        user_name: String,
        #[serde(default)]
        chat_id: Option<i64>,
    },

    #[serde(rename = "device_info")]
    DeviceInfo {
        device_id: String,
        device_code: String,
        #[serde(default)]
        connected_chat: Option<i64>,
    },

    #[serde(rename = "data_update")]
    DataUpdate {
        #[serde(default)]
        user_memory: Value,
        #[serde(default)]
        conversation_history: Value,
    },

    #[serde(rename = "memory_saved")]
    MemorySaved,

    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        ts: Option<Value>,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        ts: Option<Value>,
    },
}

/// Messages sent to the server. Recognized speech is sent unwrapped, as
/// plain text, and does not appear here.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "initial_data")]
    InitialData { data: DeviceRecord },

    #[serde(rename = "keepalive")]
    Keepalive { ts: i64 },

    #[serde(rename = "connection_response")]
    ConnectionResponse { request_id: String, approved: bool },
}

impl ClientMessage {
    pub fn to_text(&self) -> String {
        // The enum serializes infallibly: tag plus plain fields.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Classification of one inbound frame.
#[derive(Debug, Clone)]
pub enum InboundPayload {
    /// A recognized structured message.
    Structured(ServerMessage),
    /// Not JSON, or JSON without a kind: narratable text.
    PlainText(String),
    /// Structured but of an unknown or malformed kind; ignored.
    Unrecognized(String),
}

/// Decide what an inbound frame is.
pub fn classify_inbound(raw: &str) -> InboundPayload {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return InboundPayload::PlainText(raw.to_string()),
    };
    if !value.is_object() {
        return InboundPayload::PlainText(raw.to_string());
    }
    match value.get("type").and_then(|t| t.as_str()) {
        // JSON without a kind is shown/narrated as-is.
        None => InboundPayload::PlainText(raw.to_string()),
        Some(kind) => match serde_json::from_value::<ServerMessage>(value.clone()) {
            Ok(msg) => InboundPayload::Structured(msg),
            Err(e) => {
                warn!(kind, "unhandled message kind: {}", e);
                InboundPayload::Unrecognized(kind.to_string())
            }
        },
    }
}

/// Body of `GET /family/messages`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FamilyInbox {
    #[serde(default)]
    pub all_messages: Vec<FamilyMessage>,
    #[serde(default)]
    pub total_unread: Option<u32>,
}

impl FamilyInbox {
    /// Server-reported unread count, or a local count as fallback.
    pub fn unread_count(&self) -> u32 {
        self.total_unread
            .unwrap_or_else(|| self.all_messages.iter().filter(|m| !m.read).count() as u32)
    }
}

/// Body of `GET /memory/cofre`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryChest {
    #[serde(default)]
    pub important_memories: Vec<MemoryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryEntry {
    pub id: i64,
    pub content: String,
}
