//! Events fanned out to every live connection.

use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, MessageId};

/// Event discriminant, as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A message was stored.
    NewMessage,
    /// A message was deleted.
    DeleteMessage,
}

impl EventKind {
    /// The wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::DeleteMessage => "delete_message",
        }
    }
}

/// A tagged event: `{"type": <kind>, "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Carries the full stored message.
    NewMessage(ChatMessage),
    /// Carries the id of the removed message.
    DeleteMessage(MessageId),
}

impl Event {
    /// Create a `new_message` event.
    #[must_use]
    pub fn new_message(message: ChatMessage) -> Self {
        Self::NewMessage(message)
    }

    /// Create a `delete_message` event.
    #[must_use]
    pub fn delete_message(id: MessageId) -> Self {
        Self::DeleteMessage(id)
    }

    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::DeleteMessage(_) => EventKind::DeleteMessage,
        }
    }

    /// Id of the message this event is about.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::NewMessage(msg) => msg.id,
            Self::DeleteMessage(id) => *id,
        }
    }
}
