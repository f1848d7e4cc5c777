//! Per-connection operation executor.
//!
//! One actor per connection, spawned by the router on the connection's first
//! long-running operation. It tracks the connection's active operation ids;
//! each operation runs in its own task under a child cancellation token and
//! sends its results to the router.
//!
//! Starting an id that is already active restarts it: the running operation
//! is cancelled without a `complete` and the new request takes its place.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use herald_core::{ConnectionId, Envelope, GraphQLRequest, GraphQLResult, SubProtocol};
use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::execution::{GraphQLExecutor, RequestInfo};
use crate::metrics::{OPERATION_ERRORS_TOTAL, OPERATIONS_ACTIVE};
use crate::router::RouterHandle;

/// Everything an operation needs from its connection.
pub(crate) struct OperationScope<E: GraphQLExecutor> {
    pub(crate) executor: Arc<E>,
    pub(crate) connection_id: ConnectionId,
    pub(crate) context: E::Context,
    pub(crate) info: Arc<RequestInfo>,
    pub(crate) protocol: &'static dyn SubProtocol,
    pub(crate) router: RouterHandle<E::Context>,
}

impl<E: GraphQLExecutor> OperationScope<E> {
    fn envelope(&self, operation_id: &str, result: &GraphQLResult) -> Envelope {
        Envelope::for_operation(operation_id, self.protocol.next()).with_payload(result.to_value())
    }
}

enum ExecutorCommand {
    Begin {
        operation_id: String,
        request: GraphQLRequest,
    },
    Cancel {
        operation_id: String,
        ack: oneshot::Sender<()>,
    },
    Terminate,
    Finished {
        operation_id: String,
        generation: u64,
    },
}

/// Inbox of a running operation executor.
#[derive(Clone, Debug)]
pub(crate) struct OperationExecutorHandle {
    tx: mpsc::UnboundedSender<ExecutorCommand>,
}

impl OperationExecutorHandle {
    /// Spawn an executor with no active operations.
    pub(crate) fn spawn<E: GraphQLExecutor>(
        scope: OperationScope<E>,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = debug_span!("operation_executor", connection_id = %scope.connection_id);
        let executor = OperationExecutor {
            scope: Arc::new(scope),
            active: HashMap::new(),
            generation: 0,
            inbox: tx.downgrade(),
            token,
        };
        drop(tokio::spawn(executor.run(rx).instrument(span)));
        Self { tx }
    }

    pub(crate) fn begin(&self, operation_id: String, request: GraphQLRequest) {
        let _ = self.tx.send(ExecutorCommand::Begin {
            operation_id,
            request,
        });
    }

    /// Cancel one operation; `ack` fires once it can no longer send results.
    pub(crate) fn cancel(&self, operation_id: String, ack: oneshot::Sender<()>) {
        let _ = self.tx.send(ExecutorCommand::Cancel { operation_id, ack });
    }

    /// Cancel everything and stop; later `begin`s are discarded.
    pub(crate) fn terminate(&self) {
        let _ = self.tx.send(ExecutorCommand::Terminate);
    }
}

struct ActiveOperation {
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct OperationExecutor<E: GraphQLExecutor> {
    scope: Arc<OperationScope<E>>,
    active: HashMap<String, ActiveOperation>,
    generation: u64,
    // weak, so running operations don't keep the executor alive
    inbox: mpsc::WeakUnboundedSender<ExecutorCommand>,
    token: CancellationToken,
}

impl<E: GraphQLExecutor> OperationExecutor<E> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ExecutorCommand>) {
        debug!("executor started");
        loop {
            let command = tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            match command {
                ExecutorCommand::Begin {
                    operation_id,
                    request,
                } => self.begin(operation_id, request).await,
                ExecutorCommand::Cancel { operation_id, ack } => {
                    self.cancel(&operation_id).await;
                    let _ = ack.send(());
                }
                ExecutorCommand::Terminate => break,
                ExecutorCommand::Finished {
                    operation_id,
                    generation,
                } => {
                    let current = self
                        .active
                        .get(&operation_id)
                        .is_some_and(|op| op.generation == generation);
                    if current {
                        let _ = self.active.remove(&operation_id);
                        gauge!(OPERATIONS_ACTIVE).decrement(1.0);
                        trace!(operation_id = %operation_id, "operation finished");
                    }
                }
            }
        }

        self.token.cancel();
        let remaining = self.active.len();
        #[allow(clippy::cast_precision_loss)]
        let remaining_gauge = remaining as f64;
        gauge!(OPERATIONS_ACTIVE).decrement(remaining_gauge);
        self.active.clear();
        debug!(cancelled = remaining, "executor stopped");
    }

    async fn begin(&mut self, operation_id: String, request: GraphQLRequest) {
        if self.active.contains_key(&operation_id) {
            debug!(operation_id = %operation_id, "operation id reused, restarting");
            self.cancel(&operation_id).await;
        }

        self.generation += 1;
        let generation = self.generation;
        let token = self.token.child_token();
        let span = debug_span!("operation", operation_id = %operation_id);
        let task = tokio::spawn(
            run_operation(
                Arc::clone(&self.scope),
                operation_id.clone(),
                request,
                token.clone(),
                generation,
                self.inbox.clone(),
            )
            .instrument(span),
        );
        gauge!(OPERATIONS_ACTIVE).increment(1.0);
        let _ = self.active.insert(
            operation_id,
            ActiveOperation {
                generation,
                token,
                task,
            },
        );
    }

    async fn cancel(&mut self, operation_id: &str) {
        let Some(operation) = self.active.remove(operation_id) else {
            return;
        };
        operation.token.cancel();
        // once joined, the result stream and its topic consumers are dropped
        let _ = operation.task.await;
        gauge!(OPERATIONS_ACTIVE).decrement(1.0);
        debug!(operation_id, "operation cancelled");
    }
}

async fn run_operation<E: GraphQLExecutor>(
    scope: Arc<OperationScope<E>>,
    operation_id: String,
    request: GraphQLRequest,
    token: CancellationToken,
    generation: u64,
    inbox: mpsc::WeakUnboundedSender<ExecutorCommand>,
) {
    let subscribed = tokio::select! {
        biased;
        () = token.cancelled() => return,
        subscribed = scope.executor.subscribe(
            request,
            scope.context.clone(),
            Arc::clone(&scope.info),
        ) => subscribed,
    };

    match subscribed {
        Ok(mut results) => loop {
            tokio::select! {
                biased;
                () = token.cancelled() => return,
                item = results.next() => match item {
                    Some(result) => {
                        let envelope = scope.envelope(&operation_id, &result);
                        scope.router.next(scope.connection_id.clone(), envelope);
                    }
                    None => {
                        scope.router.complete(scope.connection_id.clone(), operation_id.clone());
                        break;
                    }
                },
            }
        },
        Err(error) => {
            warn!(error = %error, "operation failed to resolve");
            counter!(OPERATION_ERRORS_TOTAL).increment(1);
            let envelope = scope.envelope(&operation_id, &GraphQLResult::from(error));
            scope
                .router
                .outgoing(scope.connection_id.clone(), operation_id.clone(), envelope);
        }
    }

    if let Some(inbox) = inbox.upgrade() {
        let _ = inbox.send(ExecutorCommand::Finished {
            operation_id,
            generation,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterStats;
    use crate::test_support::{ChatExecutor, TIMEOUT, recv_json, wait_for_consumers};
    use crate::{Router, connection::OutboundFrame};
    use herald_pubsub::PubSub;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    /// A router with one registered connection `a`.
    async fn setup() -> (
        PubSub,
        RouterHandle<()>,
        mpsc::Receiver<OutboundFrame>,
        CancellationToken,
    ) {
        let pubsub = PubSub::new();
        let token = CancellationToken::new();
        let (router, _task) = Router::spawn(Arc::new(ChatExecutor::new(pubsub.clone())), token.clone());
        let (conn, rx) = crate::test_support::connection("a");
        router.connect(conn);
        assert_eq!(router.stats().await.connections, 1);
        (pubsub, router, rx, token)
    }

    #[tokio::test]
    async fn restart_replaces_running_operation() {
        let (pubsub, router, mut rx, _token) = setup().await;

        router.start("a".into(), "1", GraphQLRequest::new("subscription { chat }"));
        wait_for_consumers(&pubsub, "chat", 1).await;
        router.start("a".into(), "1", GraphQLRequest::new("subscription { chat }"));
        // queued behind the restart, so the replaced run is gone afterwards
        router.stop("a".into(), "unrelated").await;
        wait_for_consumers(&pubsub, "chat", 1).await;
        pubsub.publish("chat", String::from("once")).await;
        assert_eq!(
            recv_json(&mut rx).await,
            json!({"id": "1", "type": "next", "payload": {"data": "once"}})
        );
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn resolution_error_sends_error_then_complete() {
        let (_pubsub, router, mut rx, _token) = setup().await;

        router.start("a".into(), "9", GraphQLRequest::new("subscription { explode }"));

        assert_eq!(
            recv_json(&mut rx).await,
            json!({"id": "9", "type": "next", "payload": {"errors": [{"message": "resolver exploded"}]}})
        );
        assert_eq!(recv_json(&mut rx).await, json!({"id": "9", "type": "complete"}));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (pubsub, router, _rx, _token) = setup().await;

        router.start("a".into(), "1", GraphQLRequest::new("subscription { chat }"));
        wait_for_consumers(&pubsub, "chat", 1).await;
        timeout(TIMEOUT, router.stop("a".into(), "1")).await.unwrap();
        timeout(TIMEOUT, router.stop("a".into(), "1")).await.unwrap();
        assert_eq!(pubsub.consumer_count("chat").await, 0);
    }

    #[tokio::test]
    async fn finished_operation_id_can_start_again() {
        let (pubsub, router, mut rx, _token) = setup().await;

        router.start("a".into(), "1", GraphQLRequest::new("subscription { chat }"));
        wait_for_consumers(&pubsub, "chat", 1).await;
        pubsub.close("chat").await;
        assert_eq!(recv_json(&mut rx).await["type"], "complete");

        router.start("a".into(), "1", GraphQLRequest::new("subscription { chat }"));
        wait_for_consumers(&pubsub, "chat", 1).await;
        pubsub.publish("chat", String::from("again")).await;
        assert_eq!(recv_json(&mut rx).await["payload"]["data"], "again");
    }

    #[tokio::test]
    async fn terminate_releases_every_operation() {
        let (pubsub, router, _rx, _token) = setup().await;

        for id in ["1", "2", "3"] {
            router.start("a".into(), id, GraphQLRequest::new("subscription { chat }"));
        }
        wait_for_consumers(&pubsub, "chat", 3).await;

        router.disconnect("a".into());
        wait_for_consumers(&pubsub, "chat", 0).await;
        assert_eq!(router.stats().await, RouterStats::default());
    }
}
