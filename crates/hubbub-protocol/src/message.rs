//! Chat message model.
//!
//! Messages are owned by the storage collaborator; the hub only ever sees
//! them inside an [`Event`](crate::Event) payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Storage-assigned message identifier.
pub type MessageId = i64;

/// Maximum stored content length, in characters.
pub const MAX_CONTENT_LENGTH: usize = 4000;

/// Maximum stored nickname length, in characters.
pub const MAX_NICKNAME_LENGTH: usize = 64;

/// Nickname used when the author leaves the field empty.
pub const ANONYMOUS_NICKNAME: &str = "anonymous";

/// Display format for `formattedTime` (`15:04 02.01.06`).
const DISPLAY_TIME_FORMAT: &str = "%H:%M %d.%m.%y";

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatMessage {
    /// Storage-assigned identifier.
    pub id: MessageId,
    /// Author nickname.
    pub nickname: String,
    /// Message body.
    pub content: String,
    /// When the message was accepted.
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn new(id: MessageId, nickname: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            nickname: nickname.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Human readable timestamp, e.g. `09:41 16.10.26`.
    #[must_use]
    pub fn formatted_time(&self) -> String {
        self.created_at.format(DISPLAY_TIME_FORMAT).to_string()
    }
}

// Serialized by hand so the derived `formattedTime` travels with the message.
impl Serialize for ChatMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            id: MessageId,
            nickname: &'a str,
            content: &'a str,
            created_at: &'a DateTime<Utc>,
            #[serde(rename = "formattedTime")]
            formatted_time: String,
        }

        Wire {
            id: self.id,
            nickname: &self.nickname,
            content: &self.content,
            created_at: &self.created_at,
            formatted_time: self.formatted_time(),
        }
        .serialize(serializer)
    }
}

/// A message submitted by a client, before storage assigns an id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Author nickname (may be empty).
    #[serde(default)]
    pub nickname: String,
    /// Message body.
    #[serde(default)]
    pub content: String,
}

impl NewMessage {
    /// Create a new submission.
    #[must_use]
    pub fn new(nickname: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            content: content.into(),
        }
    }

    /// Apply the storage rules: default nickname and length caps.
    ///
    /// The caps keep any stored message encodable as a single event frame.
    /// Returns `None` when there is no content to store.
    #[must_use]
    pub fn normalize(mut self) -> Option<Self> {
        if self.content.is_empty() {
            return None;
        }
        if self.nickname.is_empty() {
            self.nickname = ANONYMOUS_NICKNAME.to_string();
        }
        truncate_chars(&mut self.nickname, MAX_NICKNAME_LENGTH);
        truncate_chars(&mut self.content, MAX_CONTENT_LENGTH);
        Some(self)
    }

    /// Turn the submission into a stored message.
    #[must_use]
    pub fn into_message(self, id: MessageId, created_at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id,
            nickname: self.nickname,
            content: self.content,
            created_at,
        }
    }
}

fn truncate_chars(s: &mut String, max: usize) {
    if let Some((cut, _)) = s.char_indices().nth(max) {
        s.truncate(cut);
    }
}
