//! Codec for encoding and decoding hubbub events.
//!
//! Events travel as one JSON document per WebSocket text frame, so there is no
//! length prefix: the transport already delimits frames.

use bytes::Bytes;
use thiserror::Error;

use crate::event::Event;

/// Maximum encoded event size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode an event to a JSON frame payload.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is too large.
pub fn encode(event: &Event) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(event).map_err(ProtocolError::Encode)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode an event from a JSON frame payload.
///
/// # Errors
///
/// Returns an error if the data is too large or is not a valid event.
pub fn decode(data: &[u8]) -> Result<Event, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    serde_json::from_slice(data).map_err(ProtocolError::Decode)
}
