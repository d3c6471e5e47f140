//! Wire message types and the sequential playback queue.

pub mod playback;
pub mod wire;

pub use playback::{MessagePlaybackQueue, PlaybackAction, CLOSING_REMARK, MESSAGE_GAP};
pub use wire::{
    classify_inbound, ClientMessage, FamilyInbox, FamilyMessage, InboundPayload, MemoryChest,
    MemoryEntry, ServerMessage, UserInfo,
};
