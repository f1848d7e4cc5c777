//! Client frame dispatch for one WebSocket session.
//!
//! Decodes each text frame with the negotiated subprotocol and turns it into
//! router events. Replies that belong to the session itself (`connection_ack`,
//! `pong`, protocol errors, close frames) go straight onto the socket's
//! outbound queue; everything operation-related goes through the router.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use herald_core::{
    ClientMessage, ConnectionId, Envelope, GraphQLError, OperationKind, SubProtocol,
};
use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, OutboundFrame};
use crate::execution::{GraphQLExecutor, RequestInfo};
use crate::metrics::WS_PROTOCOL_ERRORS_TOTAL;
use crate::router::RouterHandle;

/// Close code: operation frame before `connection_init`.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
/// Close code: the executor rejected `connection_init`.
pub const CLOSE_FORBIDDEN: u16 = 4403;
/// Close code: a second `connection_init`.
pub const CLOSE_TOO_MANY_INITS: u16 = 4429;
/// Close code: the client asked to terminate.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code: server shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Whether the session keeps reading after a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Stop reading; the socket is closing.
    Close,
}

/// Per-socket protocol state machine.
pub struct SessionHandler<E: GraphQLExecutor> {
    connection_id: ConnectionId,
    protocol: &'static dyn SubProtocol,
    info: Arc<RequestInfo>,
    executor: Arc<E>,
    router: RouterHandle<E::Context>,
    outbound: mpsc::Sender<OutboundFrame>,
    acknowledged: Arc<AtomicBool>,
}

impl<E: GraphQLExecutor> SessionHandler<E> {
    /// Create a handler for a freshly upgraded socket.
    ///
    /// `acknowledged` is shared with the writer task, which only sends
    /// keep-alives once the connection is acknowledged.
    pub fn new(
        connection_id: ConnectionId,
        protocol: &'static dyn SubProtocol,
        info: Arc<RequestInfo>,
        executor: Arc<E>,
        router: RouterHandle<E::Context>,
        outbound: mpsc::Sender<OutboundFrame>,
        acknowledged: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection_id,
            protocol,
            info,
            executor,
            router,
            outbound,
            acknowledged,
        }
    }

    /// Whether `connection_init` has been accepted.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    /// Handle one client text frame.
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        let message = match self.protocol.decode(text) {
            Ok(message) => message,
            Err(error) => {
                debug!(error = %error, "undecodable client frame");
                counter!(WS_PROTOCOL_ERRORS_TOTAL).increment(1);
                let payload = self
                    .protocol
                    .error_payload(&[GraphQLError::new(error.to_string())]);
                let envelope = match error.operation_id() {
                    Some(id) => Envelope::for_operation(id, self.protocol.error()),
                    None => Envelope::new(self.protocol.error()),
                };
                self.reply(envelope.with_payload(payload)).await;
                return Flow::Continue;
            }
        };

        match message {
            ClientMessage::Init { payload } => self.on_init(payload).await,
            ClientMessage::Subscribe { id, request } => {
                if !self.is_acknowledged() {
                    return self.close(CLOSE_UNAUTHORIZED, "Unauthorized").await;
                }
                let kind = self.executor.operation_kind(&request);
                trace!(operation_id = %id, ?kind, "operation requested");
                if kind == Some(OperationKind::Subscription) {
                    self.router.start(self.connection_id.clone(), id, request);
                } else {
                    // unknown kinds go through execute, which reports the problem
                    self.router.once(self.connection_id.clone(), id, request);
                }
                Flow::Continue
            }
            ClientMessage::Stop { id } => {
                if self.is_acknowledged() {
                    self.router.stop(self.connection_id.clone(), id).await;
                }
                Flow::Continue
            }
            ClientMessage::Ping { payload } => {
                if let Some(pong) = self.protocol.pong(payload) {
                    self.reply(pong).await;
                }
                Flow::Continue
            }
            ClientMessage::Pong => Flow::Continue,
            ClientMessage::Terminate => self.close(CLOSE_NORMAL, "Normal Closure").await,
        }
    }

    async fn on_init(&mut self, payload: Option<Value>) -> Flow {
        if self.is_acknowledged() {
            return self
                .close(CLOSE_TOO_MANY_INITS, "Too many initialisation requests")
                .await;
        }
        let context = match self
            .executor
            .build_context(&self.info, payload.as_ref())
            .await
        {
            Ok(context) => context,
            Err(error) => {
                warn!(error = %error, "connection_init rejected");
                return self.close(CLOSE_FORBIDDEN, "Forbidden").await;
            }
        };

        self.router.connect(Connection::new(
            self.connection_id.clone(),
            context,
            Arc::clone(&self.info),
            self.protocol,
            self.outbound.clone(),
        ));
        self.acknowledged.store(true, Ordering::Release);
        for envelope in self.protocol.init_responses() {
            self.reply(envelope).await;
        }
        info!("connection acknowledged");
        Flow::Continue
    }

    /// Queue a close frame.
    pub async fn close(&self, code: u16, reason: &'static str) -> Flow {
        debug!(code, reason, "closing socket");
        let _ = self.outbound.send(OutboundFrame::Close { code, reason }).await;
        Flow::Close
    }

    async fn reply(&self, envelope: Envelope) {
        if self
            .outbound
            .send(OutboundFrame::Text(envelope.to_json()))
            .await
            .is_err()
        {
            trace!(kind = %envelope.kind, "writer gone, reply dropped");
        }
    }

    /// The socket is done: unregister from the router.
    pub fn finish(self) {
        if self.is_acknowledged() {
            self.router.disconnect(self.connection_id);
        }
    }
}
