//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] into the [`FrameSink`] /
//! [`FrameStream`] pair the pumps operate on.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};

use crate::traits::{Frame, FrameSink, FrameStream, TransportError};

impl From<Message> for Frame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Frame::Text(Bytes::from(text)),
            Message::Binary(data) => Frame::Binary(Bytes::from(data)),
            Message::Ping(data) => Frame::Ping(Bytes::from(data)),
            Message::Pong(data) => Frame::Pong(Bytes::from(data)),
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            // Payloads come from the JSON encoder and are always valid UTF-8.
            Frame::Text(data) => Message::Text(String::from_utf8_lossy(&data).into_owned()),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
            Frame::Ping(data) => Message::Ping(data.to_vec()),
            Frame::Pong(data) => Message::Pong(data.to_vec()),
            Frame::Close => Message::Close(None),
        }
    }
}

/// Split an upgraded WebSocket into its outbound and inbound halves.
pub fn split(socket: WebSocket) -> (impl FrameSink, impl FrameStream) {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame))));

    let stream = stream.map(|result| {
        result
            .map(Frame::from)
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))
    });

    (sink, stream)
}
