//! Per-connection read and write pumps.
//!
//! Each connection runs two loops: the read pump drains the network stream
//! (enforcing the rate limiter and the idle deadline), the write pump drains
//! the outbound queue to the network (with keepalive pings and a write
//! deadline). Both send the connection's id to the hub's unregister queue on
//! exit; the hub ignores the second one. When the read pump stops first it
//! tells the write pump directly, so the socket closes even while the hub is
//! busy elsewhere.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use hubbub_protocol::codec;
use hubbub_transport::{Frame, FrameSink, FrameStream, TransportError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionId};
use crate::hub::Hub;
use crate::rate_limit::RateLimiter;

/// Pump timing and behaviour.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Maximum silence (no frame of any kind) before the read pump gives up.
    pub idle_timeout: Duration,
    /// Keepalive ping period. Must be shorter than `idle_timeout`.
    pub ping_interval: Duration,
    /// Deadline for a single network write.
    pub write_timeout: Duration,
    /// Rebroadcast inbound frames that decode as events.
    pub relay_inbound: bool,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            relay_inbound: false,
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The peer sent a close frame or the stream ended.
    PeerClosed,
    /// Nothing arrived within the idle deadline.
    IdleTimeout,
    /// The peer exceeded its inbound rate.
    RateLimited,
    /// The hub closed the outbound queue.
    QueueClosed,
    /// The read pump stopped first.
    ReaderStopped,
    /// The hub is no longer running.
    HubClosed,
    /// A read or write failed.
    Transport(String),
}

impl From<TransportError> for ExitReason {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Run a connection to completion.
///
/// Registers the connection, spawns its write pump and runs the read pump on
/// the current task. Returns the read pump's exit reason once both pumps have
/// stopped.
pub async fn serve<K, S>(
    connection: Connection,
    hub: Hub,
    sink: K,
    stream: S,
    config: PumpConfig,
) -> ExitReason
where
    K: FrameSink + 'static,
    S: FrameStream,
{
    let (handle, outbound, limiter) = connection.into_parts();
    let id = handle.id();

    if hub.register(handle).await.is_err() {
        debug!(connection = %id, "Hub closed before registration");
        return ExitReason::HubClosed;
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    let writer = tokio::spawn(write_pump(
        id,
        outbound,
        sink,
        stop_rx,
        hub.clone(),
        config.clone(),
    ));
    let reason = read_pump(id, stream, limiter, &hub, &config).await;
    // The writer may already be gone.
    let _ = stop_tx.send(());

    match writer.await {
        Ok(write_reason) => {
            debug!(connection = %id, read = ?reason, write = ?write_reason, "Connection finished");
        }
        Err(e) => warn!(connection = %id, error = %e, "Write pump task failed"),
    }

    reason
}

/// Read frames until the peer goes away, misbehaves or falls silent.
///
/// Always queues an unregister for `id` before returning.
pub async fn read_pump<S: FrameStream>(
    id: ConnectionId,
    mut stream: S,
    mut limiter: RateLimiter,
    hub: &Hub,
    config: &PumpConfig,
) -> ExitReason {
    let reason = read_loop(id, &mut stream, &mut limiter, hub, config).await;

    if hub.unregister(id).await.is_err() {
        trace!(connection = %id, "Hub already closed");
    }

    match reason {
        ExitReason::RateLimited => warn!(connection = %id, "Read pump stopped: rate limit exceeded"),
        ref other => debug!(connection = %id, reason = ?other, "Read pump stopped"),
    }
    reason
}

async fn read_loop<S: FrameStream>(
    id: ConnectionId,
    stream: &mut S,
    limiter: &mut RateLimiter,
    hub: &Hub,
    config: &PumpConfig,
) -> ExitReason {
    loop {
        // The deadline restarts with every frame, keepalives included.
        let frame = match timeout(config.idle_timeout, stream.next()).await {
            Err(_) => return ExitReason::IdleTimeout,
            Ok(None) => return ExitReason::PeerClosed,
            Ok(Some(Err(e))) => return e.into(),
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Close => return ExitReason::PeerClosed,
            Frame::Ping(_) | Frame::Pong(_) => {
                trace!(connection = %id, "Keepalive received");
            }
            Frame::Text(data) | Frame::Binary(data) => {
                if !limiter.allow() {
                    return ExitReason::RateLimited;
                }
                if config.relay_inbound {
                    if let Err(reason) = relay(id, data, hub).await {
                        return reason;
                    }
                } else {
                    trace!(connection = %id, bytes = data.len(), "Inbound frame ignored");
                }
            }
        }
    }
}

async fn relay(id: ConnectionId, data: Bytes, hub: &Hub) -> Result<(), ExitReason> {
    match codec::decode(&data) {
        Ok(event) => {
            trace!(connection = %id, kind = event.kind().as_str(), "Relaying inbound event");
            hub.broadcast(data)
                .await
                .map_err(|_| ExitReason::HubClosed)
        }
        Err(e) => {
            debug!(connection = %id, error = %e, "Dropping invalid inbound frame");
            Ok(())
        }
    }
}

/// Drain the outbound queue to the network until it closes or a write fails.
///
/// Sends a close frame when the hub closes the queue or `stop` fires, and
/// pings every `ping_interval`. Closes the sink and queues an unregister for
/// `id` before returning.
pub async fn write_pump<K: FrameSink>(
    id: ConnectionId,
    mut outbound: mpsc::Receiver<Bytes>,
    mut sink: K,
    mut stop: oneshot::Receiver<()>,
    hub: Hub,
    config: PumpConfig,
) -> ExitReason {
    let mut keepalive = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;

            // A dropped sender counts as a stop too.
            _ = &mut stop => {
                if let Err(e) = send_frame(&mut sink, Frame::Close, config.write_timeout).await {
                    trace!(connection = %id, error = %e, "Close frame not sent");
                }
                break ExitReason::ReaderStopped;
            }

            payload = outbound.recv() => match payload {
                Some(payload) => {
                    trace!(connection = %id, bytes = payload.len(), "Writing frame");
                    if let Err(e) = send_frame(&mut sink, Frame::Text(payload), config.write_timeout).await {
                        break e.into();
                    }
                }
                None => {
                    if let Err(e) = send_frame(&mut sink, Frame::Close, config.write_timeout).await {
                        trace!(connection = %id, error = %e, "Close frame not sent");
                    }
                    break ExitReason::QueueClosed;
                }
            },

            _ = keepalive.tick() => {
                trace!(connection = %id, "Sending ping");
                if let Err(e) = send_frame(&mut sink, Frame::ping(), config.write_timeout).await {
                    break e.into();
                }
            }
        }
    };

    // Let a hub blocked on this queue fail fast instead of waiting on us.
    drop(outbound);

    if let Ok(Err(e)) = timeout(config.write_timeout, sink.close()).await {
        trace!(connection = %id, error = %e, "Sink close failed");
    }

    if hub.unregister(id).await.is_err() {
        trace!(connection = %id, "Hub already closed");
    }

    debug!(connection = %id, reason = ?reason, "Write pump stopped");
    reason
}

async fn send_frame<K: FrameSink>(
    sink: &mut K,
    frame: Frame,
    deadline: Duration,
) -> Result<(), TransportError> {
    match timeout(deadline, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}
