//! Message storage.

use chrono::Utc;
use hubbub_protocol::{ChatMessage, MessageId, NewMessage};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No message with this id.
    #[error("Message {0} not found")]
    NotFound(MessageId),
}

/// Persistence seam for chat messages.
pub trait MessageStore: Send + Sync {
    /// Store a normalized submission and return it with its assigned id.
    fn insert(&self, message: NewMessage) -> ChatMessage;

    /// Look up one message.
    fn get(&self, id: MessageId) -> Option<ChatMessage>;

    /// Remove one message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id is unknown.
    fn delete(&self, id: MessageId) -> Result<(), StoreError>;

    /// All messages in insertion order.
    fn list_all(&self) -> Vec<ChatMessage>;
}

/// In-memory message store. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    next_id: MessageId,
    messages: BTreeMap<MessageId, ChatMessage>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                messages: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves the map consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryStore {
    fn insert(&self, message: NewMessage) -> ChatMessage {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let stored = message.into_message(id, Utc::now());
        inner.messages.insert(id, stored.clone());
        stored
    }

    fn get(&self, id: MessageId) -> Option<ChatMessage> {
        self.lock().messages.get(&id).cloned()
    }

    fn delete(&self, id: MessageId) -> Result<(), StoreError> {
        self.lock()
            .messages
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    fn list_all(&self) -> Vec<ChatMessage> {
        // Ids are monotonic, so key order is insertion order.
        self.lock().messages.values().cloned().collect()
    }
}
