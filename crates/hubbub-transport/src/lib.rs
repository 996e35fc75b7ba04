//! # hubbub-transport
//!
//! Transport abstraction layer for the hubbub realtime chat hub.
//!
//! - **WebSocket** - axum upgrades, split into a sink/stream pair
//! - **Memory** - an in-process pair used to drive the pumps without a socket
//!
//! ## Transport Abstraction
//!
//! The per-connection pumps are generic over [`FrameSink`] and
//! [`FrameStream`], so they never see the WebSocket library directly.
//!
//! ```rust,ignore
//! use hubbub_transport::websocket;
//!
//! async fn on_upgrade(socket: axum::extract::ws::WebSocket) {
//!     let (sink, stream) = websocket::split(socket);
//!     // hand the halves to the write and read pumps
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Frame, FrameSink, FrameStream, TransportError};
