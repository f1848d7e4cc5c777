//! A registered client connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use herald_core::{ConnectionId, Envelope, SubProtocol};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::warn;

use crate::execution::RequestInfo;
use crate::metrics::{ENVELOPES_DROPPED_TOTAL, ENVELOPES_SENT_TOTAL};

/// A frame queued for a socket's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A text frame.
    Text(String),
    /// Close the socket with a code and reason.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: &'static str,
    },
}

/// A live client connection, owned by the router once registered.
///
/// Carries the application context built at `connection_init`, the request
/// that opened the socket, the negotiated subprotocol, and the sending half
/// of the socket's outbound queue.
pub struct Connection<C> {
    id: ConnectionId,
    context: C,
    info: Arc<RequestInfo>,
    protocol: &'static dyn SubProtocol,
    tx: mpsc::Sender<OutboundFrame>,
    connected_at: Instant,
    dropped_frames: AtomicU64,
}

impl<C> Connection<C> {
    /// Create a connection.
    pub fn new(
        id: ConnectionId,
        context: C,
        info: Arc<RequestInfo>,
        protocol: &'static dyn SubProtocol,
        tx: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            id,
            context,
            info,
            protocol,
            tx,
            connected_at: Instant::now(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Application context.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// The request that opened the connection.
    pub fn info(&self) -> Arc<RequestInfo> {
        Arc::clone(&self.info)
    }

    /// Negotiated subprotocol.
    pub fn protocol(&self) -> &'static dyn SubProtocol {
        self.protocol
    }

    /// Queue a raw text frame.
    ///
    /// Never waits: returns `false` and counts a drop when the queue is full
    /// or the socket is gone.
    pub fn send_text(&self, text: String) -> bool {
        if self.tx.try_send(OutboundFrame::Text(text)).is_ok() {
            counter!(ENVELOPES_SENT_TOTAL).increment(1);
            true
        } else {
            let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
            counter!(ENVELOPES_DROPPED_TOTAL).increment(1);
            warn!(connection_id = %self.id, dropped, "send queue full or closed, frame dropped");
            false
        }
    }

    /// Serialize and queue an envelope.
    pub fn send(&self, envelope: &Envelope) -> bool {
        self.send_text(envelope.to_json())
    }

    /// Frames dropped so far.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Time since the connection was registered.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl<C> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("protocol", &self.protocol.name())
            .field("dropped_frames", &self.drop_count())
            .finish_non_exhaustive()
    }
}
