//! In-memory transport.
//!
//! Gives the pumps a real `Sink`/`Stream` pair without a socket. The
//! [`MemoryPeer`] plays the remote side: it injects inbound frames, observes
//! what the server wrote, and can stall the outbound half to simulate a peer
//! that stopped reading.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use tokio::sync::mpsc;

use crate::traits::{Frame, TransportError};

/// Flags shared between the local halves and the peer.
#[derive(Debug, Default)]
struct Shared {
    stalled: AtomicBool,
    closed: AtomicBool,
}

/// Outbound half: frames written here show up at [`MemoryPeer::recv`].
#[derive(Debug)]
pub struct MemorySink {
    tx: mpsc::UnboundedSender<Frame>,
    shared: Arc<Shared>,
}

/// Inbound half: yields whatever the peer sends.
#[derive(Debug)]
pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

/// The remote end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    incoming: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    written: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
}

/// Create a connected in-memory transport.
#[must_use]
pub fn pair() -> (MemorySink, MemoryStream, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());

    (
        MemorySink {
            tx: out_tx,
            shared: Arc::clone(&shared),
        },
        MemoryStream { rx: in_rx },
        MemoryPeer {
            incoming: Some(in_tx),
            written: out_rx,
            shared,
        },
    )
}

impl Sink<Frame> for MemorySink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.shared.closed.load(Ordering::SeqCst) || self.tx.is_closed() {
            return Poll::Ready(Err(TransportError::ConnectionClosed));
        }
        if self.shared.stalled.load(Ordering::SeqCst) {
            // Never woken: only a deadline gets the writer out of here.
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        self.tx
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

impl Stream for MemoryStream {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl MemoryPeer {
    /// Send a frame to the server side.
    ///
    /// Returns `false` if the server dropped its inbound half.
    pub fn send(&self, frame: Frame) -> bool {
        self.incoming
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(frame)).is_ok())
    }

    /// Make the server's next read fail with `err`.
    pub fn fail(&self, err: TransportError) -> bool {
        self.incoming
            .as_ref()
            .is_some_and(|tx| tx.send(Err(err)).is_ok())
    }

    /// End the inbound stream, as if the peer went away.
    pub fn hang_up(&mut self) {
        self.incoming = None;
    }

    /// Stop (or resume) accepting frames written by the server.
    pub fn set_stalled(&self, stalled: bool) {
        self.shared.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Whether the server closed its outbound half.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Next frame written by the server, or `None` once the sink is dropped.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.written.recv().await
    }
}
