//! Connection wrapper.
//!
//! A [`Connection`] is built at upgrade time and immediately split: the
//! [`ConnectionHandle`] (holding the only sending half of the outbound queue)
//! goes to the hub, the receiving half goes to the write pump and the
//! [`RateLimiter`] goes to the read pump.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::rate_limit::{RateLimitConfig, RateLimiter};

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One accepted streaming peer.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    address: String,
    outbound_tx: mpsc::Sender<Bytes>,
    outbound_rx: mpsc::Receiver<Bytes>,
    limiter: RateLimiter,
}

impl Connection {
    /// Create a connection with a bounded outbound queue.
    ///
    /// # Panics
    ///
    /// Panics if `outbound_capacity` is zero.
    #[must_use]
    pub fn new(address: impl Into<String>, outbound_capacity: usize, rate: RateLimitConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
        Self {
            id: ConnectionId::next(),
            address: address.into(),
            outbound_tx,
            outbound_rx,
            limiter: RateLimiter::new(rate),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Originating address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Split into the hub's handle, the write pump's queue and the read
    /// pump's limiter.
    #[must_use]
    pub fn into_parts(self) -> (ConnectionHandle, mpsc::Receiver<Bytes>, RateLimiter) {
        let handle = ConnectionHandle {
            id: self.id,
            address: self.address,
            sender: self.outbound_tx,
        };
        (handle, self.outbound_rx, self.limiter)
    }
}

/// The hub's view of a connection.
///
/// Dropping the handle closes the outbound queue.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    address: String,
    sender: mpsc::Sender<Bytes>,
}

impl ConnectionHandle {
    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Originating address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Bytes> {
        &self.sender
    }

    #[cfg(test)]
    pub(crate) fn with_id(mut self, id: ConnectionId) -> Self {
        self.id = id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_dropping_handle_closes_queue() {
        let conn = Connection::new("127.0.0.1", 4, RateLimitConfig::default());
        assert_eq!(conn.address(), "127.0.0.1");

        let (handle, mut outbound, _limiter) = conn.into_parts();
        handle.sender().send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(handle.sender().capacity(), 3);

        drop(handle);
        assert_eq!(outbound.recv().await, Some(Bytes::from_static(b"x")));
        assert_eq!(outbound.recv().await, None);
    }
}
