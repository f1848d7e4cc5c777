//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use herald_core::{
    ConnectionId, ExecutionError, GraphQLRequest, GraphQLResult, OperationKind, protocol,
};
use herald_pubsub::PubSub;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::connection::{Connection, OutboundFrame};
use crate::execution::{GraphQLExecutor, RequestInfo, ResultStream};

pub(crate) const TIMEOUT: Duration = Duration::from_secs(2);

/// Answers `{ hello }`, fails anything mentioning `explode`, and streams
/// every `String` published to the `chat` topic as `{"data": <text>}`.
/// An operation named `Live` is always streamed.
pub(crate) struct ChatExecutor {
    pubsub: PubSub,
}

impl ChatExecutor {
    pub(crate) fn new(pubsub: PubSub) -> Self {
        Self { pubsub }
    }
}

#[async_trait]
impl GraphQLExecutor for ChatExecutor {
    type Context = ();

    async fn build_context(
        &self,
        _info: &RequestInfo,
        init_payload: Option<&Value>,
    ) -> Result<(), ExecutionError> {
        match init_payload.and_then(|p| p.get("token")) {
            Some(Value::String(token)) if token == "bad" => {
                Err(ExecutionError::Validation("Forbidden".into()))
            }
            _ => Ok(()),
        }
    }

    fn operation_kind(&self, request: &GraphQLRequest) -> Option<OperationKind> {
        if request.operation_name.as_deref() == Some("Live") {
            return Some(OperationKind::Subscription);
        }
        request.operation_kind()
    }

    async fn execute(
        &self,
        request: GraphQLRequest,
        _context: (),
        _info: Arc<RequestInfo>,
    ) -> Result<GraphQLResult, ExecutionError> {
        if request.query.contains("explode") {
            return Err(ExecutionError::resolution("resolver exploded"));
        }
        Ok(GraphQLResult::data(json!({"hello": "world"})))
    }

    async fn subscribe(
        &self,
        request: GraphQLRequest,
        _context: (),
        _info: Arc<RequestInfo>,
    ) -> Result<ResultStream, ExecutionError> {
        if request.query.contains("explode") {
            return Err(ExecutionError::resolution("resolver exploded"));
        }
        let messages = self.pubsub.subscribe_typed::<String>("chat").await;
        Ok(messages
            .map(|text| GraphQLResult::data(Value::String(text)))
            .boxed())
    }
}

/// A `graphql-transport-ws` connection and the receiving end of its queue.
pub(crate) fn connection(id: &str) -> (Connection<()>, mpsc::Receiver<OutboundFrame>) {
    let (tx, rx) = mpsc::channel(64);
    let conn = Connection::new(
        ConnectionId::from(id),
        (),
        Arc::default(),
        protocol::negotiate(["graphql-transport-ws"]),
        tx,
    );
    (conn, rx)
}

/// Next queued text frame, parsed as JSON.
pub(crate) async fn recv_json(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
    match timeout(TIMEOUT, rx.recv()).await {
        Ok(Some(OutboundFrame::Text(text))) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Poll until `topic` has exactly `expected` consumers.
pub(crate) async fn wait_for_consumers(pubsub: &PubSub, topic: &str, expected: usize) {
    let poll = async {
        while pubsub.consumer_count(topic).await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(TIMEOUT, poll)
        .await
        .unwrap_or_else(|_| panic!("topic {topic} never reached {expected} consumers"));
}
