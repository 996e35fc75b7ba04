//! # hubbub-protocol
//!
//! Wire format definitions for the hubbub realtime chat hub.
//!
//! Every frame pushed to a streaming peer is one complete UTF-8 JSON document
//! of the shape `{"type": ..., "data": ...}`.
//!
//! ## Event Types
//!
//! - `new_message` - a chat message was stored; `data` is the message object
//! - `delete_message` - a chat message was removed; `data` is its id
//!
//! ## Example
//!
//! ```rust
//! use hubbub_protocol::{codec, ChatMessage, Event};
//!
//! let message = ChatMessage::new(42, "alice", "hello");
//! let encoded = codec::encode(&Event::new_message(message)).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.message_id(), 42);
//! ```

pub mod codec;
pub mod event;
pub mod message;

pub use codec::{decode, encode, ProtocolError};
pub use event::{Event, EventKind};
pub use message::{ChatMessage, MessageId, NewMessage};
