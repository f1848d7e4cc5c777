//! Connection registry and router actor.
//!
//! The router owns every registered [`Connection`] and every per-connection
//! [`OperationExecutorHandle`]. Inbound events are processed one at a time
//! in arrival order. Results computed elsewhere (one-shot executions,
//! long-running operations) come back into the same inbox before they are
//! written, so each connection has a single writer.
//!
//! Events naming a connection the router does not know are dropped: the
//! socket went away first, which is a race and not an error.

use std::collections::HashMap;
use std::sync::Arc;

use herald_core::{ConnectionId, Envelope, GraphQLRequest, GraphQLResult};
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::connection::Connection;
use crate::execution::GraphQLExecutor;
use crate::metrics::{OPERATION_ERRORS_TOTAL, OPERATIONS_TOTAL};
use crate::operations::{OperationExecutorHandle, OperationScope};

/// Registry sizes, for health reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Registered connections.
    pub connections: usize,
    /// Live operation executors.
    pub executors: usize,
}

pub(crate) enum RouterMessage<C> {
    Connect(Connection<C>),
    Disconnect {
        connection_id: ConnectionId,
    },
    Start {
        connection_id: ConnectionId,
        operation_id: String,
        request: GraphQLRequest,
    },
    Once {
        connection_id: ConnectionId,
        operation_id: String,
        request: GraphQLRequest,
    },
    Stop {
        connection_id: ConnectionId,
        operation_id: String,
        ack: oneshot::Sender<()>,
    },
    /// Final result of an operation: the envelope, then `complete`.
    Outgoing {
        connection_id: ConnectionId,
        operation_id: String,
        envelope: Envelope,
    },
    /// One streamed result of a long-running operation.
    Next {
        connection_id: ConnectionId,
        envelope: Envelope,
    },
    /// A long-running operation ran out of results.
    Complete {
        connection_id: ConnectionId,
        operation_id: String,
    },
    Stats {
        reply: oneshot::Sender<RouterStats>,
    },
}

/// Cloneable inbox of a running [`Router`].
///
/// Every method is a fire-and-forget send except [`stop`](Self::stop) and
/// [`stats`](Self::stats). Sends to a stopped router are ignored.
pub struct RouterHandle<C> {
    tx: mpsc::UnboundedSender<RouterMessage<C>>,
}

impl<C> Clone for RouterHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> std::fmt::Debug for RouterHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterHandle")
            .field("running", &!self.tx.is_closed())
            .finish()
    }
}

impl<C> RouterHandle<C> {
    fn tell(&self, message: RouterMessage<C>) {
        if self.tx.send(message).is_err() {
            trace!("router stopped, message dropped");
        }
    }

    /// Register a connection, replacing any with the same id.
    pub fn connect(&self, connection: Connection<C>) {
        self.tell(RouterMessage::Connect(connection));
    }

    /// Drop a connection and terminate its operations.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        self.tell(RouterMessage::Disconnect { connection_id });
    }

    /// Begin a long-running operation.
    pub fn start(
        &self,
        connection_id: ConnectionId,
        operation_id: impl Into<String>,
        request: GraphQLRequest,
    ) {
        self.tell(RouterMessage::Start {
            connection_id,
            operation_id: operation_id.into(),
            request,
        });
    }

    /// Run a one-shot operation; its result is followed by `complete`.
    pub fn once(
        &self,
        connection_id: ConnectionId,
        operation_id: impl Into<String>,
        request: GraphQLRequest,
    ) {
        self.tell(RouterMessage::Once {
            connection_id,
            operation_id: operation_id.into(),
            request,
        });
    }

    /// Stop one operation, waiting until it can no longer produce results.
    pub async fn stop(&self, connection_id: ConnectionId, operation_id: impl Into<String>) {
        let (ack, done) = oneshot::channel();
        self.tell(RouterMessage::Stop {
            connection_id,
            operation_id: operation_id.into(),
            ack,
        });
        // a dropped ack means the router or executor is already gone
        let _ = done.await;
    }

    /// Current registry sizes; zeroes once the router has stopped.
    pub async fn stats(&self) -> RouterStats {
        let (reply, rx) = oneshot::channel();
        self.tell(RouterMessage::Stats { reply });
        rx.await.unwrap_or_default()
    }

    pub(crate) fn outgoing(
        &self,
        connection_id: ConnectionId,
        operation_id: String,
        envelope: Envelope,
    ) {
        self.tell(RouterMessage::Outgoing {
            connection_id,
            operation_id,
            envelope,
        });
    }

    pub(crate) fn next(&self, connection_id: ConnectionId, envelope: Envelope) {
        self.tell(RouterMessage::Next {
            connection_id,
            envelope,
        });
    }

    pub(crate) fn complete(&self, connection_id: ConnectionId, operation_id: String) {
        self.tell(RouterMessage::Complete {
            connection_id,
            operation_id,
        });
    }
}

/// The router actor.
pub struct Router<E: GraphQLExecutor> {
    executor: Arc<E>,
    connections: HashMap<ConnectionId, Connection<E::Context>>,
    executors: HashMap<ConnectionId, OperationExecutorHandle>,
    handle: RouterHandle<E::Context>,
    shutdown: CancellationToken,
}

impl<E: GraphQLExecutor> Router<E> {
    /// Spawn a router on the current runtime.
    ///
    /// The router runs until `shutdown` is cancelled, then terminates every
    /// operation executor and forgets every connection.
    pub fn spawn(
        executor: Arc<E>,
        shutdown: CancellationToken,
    ) -> (RouterHandle<E::Context>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RouterHandle { tx };
        let router = Self {
            executor,
            connections: HashMap::new(),
            executors: HashMap::new(),
            handle: handle.clone(),
            shutdown,
        };
        let task = tokio::spawn(router.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RouterMessage<E::Context>>) {
        debug!("router started");
        loop {
            let message = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.handle_message(message);
        }

        for (_, executor) in self.executors.drain() {
            executor.terminate();
        }
        info!(connections = self.connections.len(), "router stopped");
        self.connections.clear();
    }

    fn handle_message(&mut self, message: RouterMessage<E::Context>) {
        match message {
            RouterMessage::Connect(connection) => self.on_connect(connection),
            RouterMessage::Disconnect { connection_id } => self.on_disconnect(&connection_id),
            RouterMessage::Start {
                connection_id,
                operation_id,
                request,
            } => self.on_start(connection_id, operation_id, request),
            RouterMessage::Once {
                connection_id,
                operation_id,
                request,
            } => self.on_once(connection_id, operation_id, request),
            RouterMessage::Stop {
                connection_id,
                operation_id,
                ack,
            } => match self.executors.get(&connection_id) {
                Some(executor) => executor.cancel(operation_id, ack),
                None => {
                    let _ = ack.send(());
                }
            },
            RouterMessage::Outgoing {
                connection_id,
                operation_id,
                envelope,
            } => self.on_outgoing(&connection_id, &operation_id, &envelope),
            RouterMessage::Next {
                connection_id,
                envelope,
            } => {
                if let Some(connection) = self.connections.get(&connection_id) {
                    let _ = connection.send(&envelope);
                }
            }
            RouterMessage::Complete {
                connection_id,
                operation_id,
            } => {
                if let Some(connection) = self.connections.get(&connection_id) {
                    let complete =
                        Envelope::for_operation(operation_id, connection.protocol().complete());
                    let _ = connection.send(&complete);
                }
            }
            RouterMessage::Stats { reply } => {
                let _ = reply.send(RouterStats {
                    connections: self.connections.len(),
                    executors: self.executors.len(),
                });
            }
        }
    }

    fn on_connect(&mut self, connection: Connection<E::Context>) {
        debug!(connection_id = %connection.id(), "connection registered");
        let _ = self.connections.insert(connection.id().clone(), connection);
    }

    fn on_disconnect(&mut self, connection_id: &ConnectionId) {
        if let Some(executor) = self.executors.remove(connection_id) {
            executor.terminate();
        }
        if self.connections.remove(connection_id).is_some() {
            debug!(connection_id = %connection_id, "connection removed");
        }
    }

    #[instrument(skip(self, request), fields(connection_id = %connection_id))]
    fn on_start(
        &mut self,
        connection_id: ConnectionId,
        operation_id: String,
        request: GraphQLRequest,
    ) {
        let Some(connection) = self.connections.get(&connection_id) else {
            trace!("unknown connection, start dropped");
            return;
        };
        counter!(OPERATIONS_TOTAL, "kind" => "subscription").increment(1);

        let executor = self.executors.entry(connection_id).or_insert_with(|| {
            let scope = OperationScope {
                executor: Arc::clone(&self.executor),
                connection_id: connection.id().clone(),
                context: connection.context().clone(),
                info: connection.info(),
                protocol: connection.protocol(),
                router: self.handle.clone(),
            };
            OperationExecutorHandle::spawn(scope, self.shutdown.child_token())
        });
        executor.begin(operation_id, request);
    }

    #[instrument(skip(self, request), fields(connection_id = %connection_id))]
    fn on_once(&mut self, connection_id: ConnectionId, operation_id: String, request: GraphQLRequest) {
        let Some(connection) = self.connections.get(&connection_id) else {
            trace!("unknown connection, once dropped");
            return;
        };
        counter!(OPERATIONS_TOTAL, "kind" => "once").increment(1);

        let executor = Arc::clone(&self.executor);
        let context = connection.context().clone();
        let info = connection.info();
        let protocol = connection.protocol();
        let router = self.handle.clone();
        let token = self.shutdown.child_token();

        drop(tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => return,
                result = executor.execute(request, context, info) => result,
            };
            let result = result.unwrap_or_else(|error| {
                warn!(operation_id = %operation_id, error = %error, "operation failed");
                counter!(OPERATION_ERRORS_TOTAL).increment(1);
                GraphQLResult::from(error)
            });
            let envelope = Envelope::for_operation(operation_id.clone(), protocol.next())
                .with_payload(result.to_value());
            router.outgoing(connection_id, operation_id, envelope);
        }));
    }

    fn on_outgoing(&self, connection_id: &ConnectionId, operation_id: &str, envelope: &Envelope) {
        let Some(connection) = self.connections.get(connection_id) else {
            trace!(connection_id = %connection_id, operation_id, "connection gone, result dropped");
            return;
        };
        let _ = connection.send(envelope);
        let complete = Envelope::for_operation(operation_id, connection.protocol().complete());
        let _ = connection.send(&complete);
    }
}
