//! The connection registry and fan-out hub.
//!
//! The hub owns the set of live connections. Nothing outside the control loop
//! ever touches that set: registrations, unregistrations and broadcasts all
//! arrive on queues and are applied one at a time by [`HubLoop::run`].
//!
//! ```text
//!  register ──┐
//! unregister ─┼──▶ HubLoop ──▶ Registry ──▶ outbound queue (per connection)
//!  broadcast ─┘
//! ```

use bytes::Bytes;
use hubbub_protocol::{codec, Event, ProtocolError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{ConnectionHandle, ConnectionId, DEFAULT_OUTBOUND_CAPACITY};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The control loop has stopped.
    #[error("Hub is closed")]
    Closed,

    /// An event could not be serialized.
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] ProtocolError),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each of the register, unregister and broadcast queues.
    pub queue_capacity: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// How long a broadcast may wait on one full outbound queue before that
    /// connection is evicted. `None` waits indefinitely.
    pub send_timeout: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            send_timeout: Some(Duration::from_secs(2)),
        }
    }
}

/// Counters maintained by the control loop.
#[derive(Debug, Default)]
struct HubCounters {
    live: AtomicUsize,
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
    pruned: AtomicU64,
}

/// Point-in-time hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Connections currently registered.
    pub live_connections: usize,
    /// Broadcasts processed.
    pub broadcasts: u64,
    /// Frames enqueued onto outbound queues.
    pub deliveries: u64,
    /// Connections dropped for not draining their queue.
    pub evictions: u64,
    /// Connections dropped because their write pump had already stopped.
    pub pruned: u64,
}

/// Cloneable handle used by pumps and HTTP handlers to talk to the hub.
#[derive(Debug, Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<ConnectionHandle>,
    unregister_tx: mpsc::Sender<ConnectionId>,
    broadcast_tx: mpsc::Sender<Bytes>,
    counters: Arc<HubCounters>,
    outbound_capacity: usize,
}

impl Hub {
    /// Create a hub and the control loop that serves it.
    ///
    /// The loop must be driven (usually with `tokio::spawn`) for any queued
    /// operation to take effect.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubLoop) {
        let (register_tx, register_rx) = mpsc::channel(config.queue_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.queue_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.queue_capacity);
        let counters = Arc::new(HubCounters::default());

        info!("Creating hub with config: {:?}", config);

        let hub = Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            counters: Arc::clone(&counters),
            outbound_capacity: config.outbound_capacity,
        };

        let control = HubLoop {
            registry: Registry::new(config.send_timeout),
            register_rx,
            unregister_rx,
            broadcast_rx,
            counters,
        };

        (hub, control)
    }

    /// Create a hub and spawn its control loop on the current runtime.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (Self, JoinHandle<()>) {
        let (hub, control) = Self::new(config);
        (hub, tokio::spawn(control.run()))
    }

    /// Outbound queue capacity new connections should use.
    #[must_use]
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    /// Queue a connection for registration.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the control loop has stopped.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.register_tx
            .send(handle)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Queue a connection for removal.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the control loop has stopped.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.unregister_tx
            .send(id)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Queue a pre-serialized payload for delivery to every live connection.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the control loop has stopped.
    pub async fn broadcast(&self, payload: Bytes) -> Result<(), HubError> {
        self.broadcast_tx
            .send(payload)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Serialize an event and broadcast it.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Serialization`] if the event cannot be encoded, or
    /// [`HubError::Closed`] if the control loop has stopped.
    pub async fn publish(&self, event: &Event) -> Result<(), HubError> {
        let payload = codec::encode(event).map_err(|e| {
            error!(kind = event.kind().as_str(), error = %e, "Failed to encode event");
            HubError::Serialization(e)
        })?;
        trace!(kind = event.kind().as_str(), bytes = payload.len(), "Publishing event");
        self.broadcast(payload).await
    }

    /// Connections registered as of the last processed command.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.counters.live.load(Ordering::Relaxed)
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            live_connections: self.counters.live.load(Ordering::Relaxed),
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            pruned: self.counters.pruned.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the payload was enqueued for.
    pub delivered: usize,
    /// Connections removed because their queue stayed full.
    pub evicted: Vec<ConnectionId>,
    /// Connections removed because their queue was already closed.
    pub pruned: Vec<ConnectionId>,
}

/// The live connection set.
///
/// Owned exclusively by the control loop; exposed so the set semantics can be
/// exercised without a runtime loop around them.
#[derive(Debug, Default)]
pub struct Registry {
    clients: HashMap<ConnectionId, ConnectionHandle>,
    send_timeout: Option<Duration>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(send_timeout: Option<Duration>) -> Self {
        Self {
            clients: HashMap::new(),
            send_timeout,
        }
    }

    /// Add a connection.
    ///
    /// Returns `false` (and drops `handle`) if the id is already registered.
    pub fn register(&mut self, handle: ConnectionHandle) -> bool {
        let id = handle.id();
        if self.clients.contains_key(&id) {
            warn!(connection = %id, "Duplicate registration ignored");
            return false;
        }
        debug!(connection = %id, address = %handle.address(), "Connection registered");
        self.clients.insert(id, handle);
        true
    }

    /// Remove a connection, closing its outbound queue.
    ///
    /// Returns `false` if the id was not registered.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        match self.clients.remove(&id) {
            Some(handle) => {
                debug!(connection = %id, address = %handle.address(), "Connection unregistered");
                true
            }
            None => {
                trace!(connection = %id, "Unregister for unknown connection");
                false
            }
        }
    }

    /// Enqueue `payload` on every registered connection.
    ///
    /// Waits on full queues; with a send timeout configured, a connection
    /// that stays full past it is evicted. Connections whose queue is already
    /// closed are pruned.
    pub async fn broadcast(&mut self, payload: &Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for (id, client) in &self.clients {
            let result = match self.send_timeout {
                Some(limit) => client.sender().send_timeout(payload.clone(), limit).await,
                None => client
                    .sender()
                    .send(payload.clone())
                    .await
                    .map_err(|e| SendTimeoutError::Closed(e.0)),
            };

            match result {
                Ok(()) => report.delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(connection = %id, address = %client.address(), "Outbound queue full, evicting slow connection");
                    report.evicted.push(*id);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    trace!(connection = %id, "Outbound queue closed, pruning");
                    report.pruned.push(*id);
                }
            }
        }

        for id in report.evicted.iter().chain(&report.pruned) {
            self.clients.remove(id);
        }

        trace!(
            delivered = report.delivered,
            evicted = report.evicted.len(),
            pruned = report.pruned.len(),
            "Broadcast processed"
        );
        report
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// The hub's single control loop.
pub struct HubLoop {
    registry: Registry,
    register_rx: mpsc::Receiver<ConnectionHandle>,
    unregister_rx: mpsc::Receiver<ConnectionId>,
    broadcast_rx: mpsc::Receiver<Bytes>,
    counters: Arc<HubCounters>,
}

impl HubLoop {
    /// Run until every [`Hub`] handle has been dropped.
    ///
    /// On exit all remaining connections are dropped, which closes their
    /// outbound queues.
    pub async fn run(mut self) {
        info!("Hub started");

        loop {
            tokio::select! {
                biased;

                Some(handle) = self.register_rx.recv() => {
                    self.registry.register(handle);
                }

                Some(id) = self.unregister_rx.recv() => {
                    self.registry.unregister(id);
                }

                Some(payload) = self.broadcast_rx.recv() => {
                    let report = self.registry.broadcast(&payload).await;
                    self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .deliveries
                        .fetch_add(report.delivered as u64, Ordering::Relaxed);
                    self.counters
                        .evictions
                        .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
                    self.counters
                        .pruned
                        .fetch_add(report.pruned.len() as u64, Ordering::Relaxed);
                }

                else => break,
            }

            self.counters
                .live
                .store(self.registry.len(), Ordering::Relaxed);
        }

        let remaining = self.registry.len();
        self.registry = Registry::default();
        self.counters.live.store(0, Ordering::Relaxed);
        info!(remaining, "Hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::rate_limit::RateLimitConfig;
    use hubbub_protocol::ChatMessage;

    fn connection(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
        let (handle, rx, _) =
            Connection::new("127.0.0.1", capacity, RateLimitConfig::default()).into_parts();
        (handle, rx)
    }

    /// Wait until the control loop has caught up with everything queued so far.
    async fn settle(hub: &Hub, expected_live: usize) {
        for _ in 0..1000 {
            if hub.connection_count() == expected_live {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!(
            "hub never reached {} live connections (has {})",
            expected_live,
            hub.connection_count()
        );
    }

    #[test]
    fn test_registry_register_unregister_sequences() {
        // Deterministic pseudo-random walk over register/unregister ops.
        let mut registry = Registry::new(None);
        let mut handles: Vec<Option<ConnectionHandle>> = Vec::new();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..16 {
            let (h, rx) = connection(1);
            ids.push(h.id());
            handles.push(Some(h));
            receivers.push(rx);
        }

        let mut expected = std::collections::HashSet::new();
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let slot = (seed % 16) as usize;
            let id = ids[slot];

            if seed & 0x100 == 0 {
                if let Some(handle) = handles[slot].take() {
                    assert!(registry.register(handle));
                    expected.insert(id);
                }
            } else {
                let removed = registry.unregister(id);
                assert_eq!(removed, expected.remove(&id));
            }

            assert_eq!(registry.len(), expected.len());
            for id in &expected {
                assert!(registry.contains(*id));
            }
        }
    }

    #[tokio::test]
    async fn test_registry_duplicate_registration() {
        let mut registry = Registry::new(None);
        let (handle, _rx) = connection(1);
        let id = handle.id();
        assert!(registry.register(handle));

        // Second handle with the same id is rejected
        let (dup, mut dup_rx, _) =
            Connection::new("127.0.0.1", 1, RateLimitConfig::default()).into_parts();
        let dup = dup.with_id(id);
        assert!(!registry.register(dup));
        assert_eq!(registry.len(), 1);
        assert_eq!(dup_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_unregister_twice_closes_once() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (handle, mut rx) = connection(8);
        let id = handle.id();

        hub.register(handle).await.unwrap();
        settle(&hub, 1).await;

        hub.unregister(id).await.unwrap();
        hub.unregister(id).await.unwrap();
        settle(&hub, 0).await;

        assert_eq!(rx.recv().await, None);
        assert_eq!(hub.connection_count(), 0);

        // The hub keeps working after the duplicate
        let (other, mut other_rx) = connection(8);
        hub.register(other).await.unwrap();
        hub.broadcast(Bytes::from_static(b"after")).await.unwrap();
        assert_eq!(other_rx.recv().await, Some(Bytes::from_static(b"after")));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_connections() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (a, mut rx_a) = connection(8);
        let (b, mut rx_b) = connection(8);
        let (c, mut rx_c) = connection(8);

        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        settle(&hub, 2).await;

        hub.broadcast(Bytes::from_static(b"hello")).await.unwrap();
        // C races the broadcast; it may or may not see it.
        hub.register(c).await.unwrap();

        assert_eq!(rx_a.recv().await, Some(Bytes::from_static(b"hello")));
        assert_eq!(rx_b.recv().await, Some(Bytes::from_static(b"hello")));
        settle(&hub, 3).await;
        let _ = rx_c.try_recv();
    }

    #[tokio::test]
    async fn test_broadcast_skips_unregistered() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (a, mut rx_a) = connection(8);
        let (b, mut rx_b) = connection(8);
        let b_id = b.id();

        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        hub.unregister(b_id).await.unwrap();
        settle(&hub, 1).await;

        hub.broadcast(Bytes::from_static(b"only-a")).await.unwrap();
        assert_eq!(rx_a.recv().await, Some(Bytes::from_static(b"only-a")));
        assert_eq!(rx_b.recv().await, None);
    }

    #[tokio::test]
    async fn test_publish_serializes_event() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (a, mut rx) = connection(8);
        hub.register(a).await.unwrap();

        let event = Event::new_message(ChatMessage::new(42, "alice", "hi"));
        hub.publish(&event).await.unwrap();

        let payload = rx.recv().await.unwrap();
        assert_eq!(codec::decode(&payload).unwrap(), event);
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["type"], "new_message");
        assert_eq!(value["data"]["id"], 42);
    }

    #[tokio::test]
    async fn test_fifo_per_publisher() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (a, mut rx) = connection(64);
        hub.register(a).await.unwrap();

        for i in 0..32u8 {
            hub.broadcast(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..32u8 {
            assert_eq!(rx.recv().await, Some(Bytes::from(vec![i])));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connection_stalls_hub_without_timeout() {
        let (hub, _task) = Hub::spawn(HubConfig {
            send_timeout: None,
            ..HubConfig::default()
        });
        let (slow, mut slow_rx) = connection(1);
        let (fast, mut fast_rx) = connection(8);
        hub.register(slow).await.unwrap();
        hub.register(fast).await.unwrap();
        settle(&hub, 2).await;

        // Fills the slow queue
        hub.broadcast(Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(fast_rx.recv().await, Some(Bytes::from_static(b"1")));

        // The loop now blocks on the slow queue, so an event queued behind
        // the stuck one never reaches the fast connection.
        hub.broadcast(Bytes::from_static(b"2")).await.unwrap();
        hub.broadcast(Bytes::from_static(b"3")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let mut fast_seen = Vec::new();
        while let Ok(b) = fast_rx.try_recv() {
            fast_seen.push(b);
        }
        assert!(!fast_seen.contains(&Bytes::from_static(b"3")));

        // Draining the slow connection releases the hub
        assert_eq!(slow_rx.recv().await, Some(Bytes::from_static(b"1")));
        assert_eq!(slow_rx.recv().await, Some(Bytes::from_static(b"2")));
        assert_eq!(slow_rx.recv().await, Some(Bytes::from_static(b"3")));
        let mut rest = fast_seen;
        while rest.len() < 2 {
            rest.push(fast_rx.recv().await.unwrap());
        }
        assert_eq!(rest, vec![Bytes::from_static(b"2"), Bytes::from_static(b"3")]);
        assert_eq!(hub.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connection_evicted_with_timeout() {
        let (hub, _task) = Hub::spawn(HubConfig {
            send_timeout: Some(Duration::from_millis(100)),
            ..HubConfig::default()
        });
        let (slow, mut slow_rx) = connection(1);
        let (fast, mut fast_rx) = connection(8);
        hub.register(slow).await.unwrap();
        hub.register(fast).await.unwrap();
        settle(&hub, 2).await;

        hub.broadcast(Bytes::from_static(b"1")).await.unwrap();
        hub.broadcast(Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(fast_rx.recv().await, Some(Bytes::from_static(b"1")));
        assert_eq!(fast_rx.recv().await, Some(Bytes::from_static(b"2")));
        settle(&hub, 1).await;

        // The evicted connection gets what was queued, then the close.
        assert_eq!(slow_rx.recv().await, Some(Bytes::from_static(b"1")));
        assert_eq!(slow_rx.recv().await, None);
        assert_eq!(hub.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_pruned() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (gone, gone_rx) = connection(8);
        hub.register(gone).await.unwrap();
        settle(&hub, 1).await;
        drop(gone_rx);

        hub.broadcast(Bytes::from_static(b"x")).await.unwrap();
        settle(&hub, 0).await;
        let stats = hub.stats();
        assert_eq!(stats.broadcasts, 1);
        assert_eq!(stats.pruned, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_report_separates_slow_and_closed() {
        let mut registry = Registry::new(Some(Duration::from_millis(50)));
        let (slow, _slow_rx) = connection(1);
        let (gone, gone_rx) = connection(8);
        let (live, mut live_rx) = connection(8);
        let (slow_id, gone_id) = (slow.id(), gone.id());
        registry.register(slow);
        registry.register(gone);
        registry.register(live);
        drop(gone_rx);

        let first = registry.broadcast(&Bytes::from_static(b"1")).await;
        assert_eq!(first.delivered, 2);
        assert_eq!(first.pruned, vec![gone_id]);
        assert!(first.evicted.is_empty());

        let second = registry.broadcast(&Bytes::from_static(b"2")).await;
        assert_eq!(second.delivered, 1);
        assert_eq!(second.evicted, vec![slow_id]);
        assert!(second.pruned.is_empty());
        assert_eq!(registry.len(), 1);

        assert_eq!(live_rx.recv().await, Some(Bytes::from_static(b"1")));
        assert_eq!(live_rx.recv().await, Some(Bytes::from_static(b"2")));
    }

    #[tokio::test]
    async fn test_loop_stops_when_handles_dropped() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        let (a, mut rx) = connection(8);
        hub.register(a).await.unwrap();
        settle(&hub, 1).await;

        drop(hub);
        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }
}
