//! Transport abstraction for hubbub.
//!
//! A connection is split into a [`FrameSink`] (owned by the write pump) and a
//! [`FrameStream`] (owned by the read pump). Any `Sink`/`Stream` pair over
//! [`Frame`] qualifies, which keeps the pumps independent of the WebSocket
//! library in use.

use bytes::Bytes;
use futures_util::{Sink, Stream};
use thiserror::Error;

/// A transport-neutral WebSocket-style frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload.
    Text(Bytes),
    /// Binary payload.
    Binary(Bytes),
    /// Keepalive probe.
    Ping(Bytes),
    /// Keepalive acknowledgment.
    Pong(Bytes),
    /// Protocol close.
    Close,
}

impl Frame {
    /// Create a text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::Text(payload.into())
    }

    /// Create an empty ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping(Bytes::new())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A read or write deadline expired.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// WebSocket upgrade handshake failed.
    #[error("Upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// The outbound half of a connection.
pub trait FrameSink: Sink<Frame, Error = TransportError> + Send + Unpin {}

impl<T> FrameSink for T where T: Sink<Frame, Error = TransportError> + Send + Unpin {}

/// The inbound half of a connection.
pub trait FrameStream: Stream<Item = Result<Frame, TransportError>> + Send + Unpin {}

impl<T> FrameStream for T where T: Stream<Item = Result<Frame, TransportError>> + Send + Unpin {}
