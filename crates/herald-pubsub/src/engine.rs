//! Engine actor: owns the topic registry.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use herald_core::ConsumerId;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::stream::{ConsumerStream, TypedStream};
use crate::topic::{Payload, TopicHandle};

/// Published values (counter).
pub const PUBSUB_PUBLISHES_TOTAL: &str = "pubsub_publishes_total";
/// Live topics (gauge).
pub const PUBSUB_TOPICS_ACTIVE: &str = "pubsub_topics_active";

enum EngineCommand {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<TopicHandle>,
    },
    Publish {
        topic: String,
        value: Payload,
    },
    Close {
        topic: String,
        reply: oneshot::Sender<()>,
    },
    TopicCount {
        reply: oneshot::Sender<usize>,
    },
    ConsumerCount {
        topic: String,
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to a publish/subscribe engine.
///
/// Cloning is cheap; every clone talks to the same engine. The engine stops
/// once the last handle is dropped; streams already handed out keep running
/// until their topic is closed or they are dropped.
///
/// A topic is created by its first `subscribe` and lives until
/// [`close`](Self::close). It is not pruned when its last consumer leaves:
/// the topic task stays parked, still counts toward
/// [`topic_count`](Self::topic_count), and serves the next subscriber.
/// Callers with unbounded topic names should `close` topics they are done
/// with.
#[derive(Clone)]
pub struct PubSub {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl PubSub {
    /// Spawn a new engine on the current tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tokio::spawn(run_engine(rx)));
        Self { tx }
    }

    /// Subscribe to `topic`, creating it if needed.
    #[instrument(skip(self, topic), fields(topic))]
    pub async fn subscribe(&self, topic: impl Into<String>) -> ConsumerStream {
        let topic = topic.into();
        let _ = tracing::Span::current().record("topic", topic.as_str());
        let id = ConsumerId::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let (reply_tx, reply_rx) = oneshot::channel();
        let handle = if self
            .tx
            .send(EngineCommand::Subscribe {
                topic,
                reply: reply_tx,
            })
            .is_ok()
        {
            reply_rx.await.ok()
        } else {
            None
        };

        match handle {
            Some(handle) => {
                // registered before the stream exists, so it can't be
                // overtaken by its own release
                handle.subscribe(id.clone(), tx);
                debug!(consumer_id = %id, "subscribed");
                ConsumerStream::new(id, Some(handle), rx)
            }
            None => {
                warn!("pubsub engine stopped, returning a finished stream");
                drop(tx);
                ConsumerStream::new(id, None, rx)
            }
        }
    }

    /// Subscribe to `topic`, keeping only payloads of type `T`.
    pub async fn subscribe_typed<T>(&self, topic: impl Into<String>) -> TypedStream<T>
    where
        T: Any + Clone + Send + Sync,
    {
        self.subscribe(topic).await.typed()
    }

    /// Deliver `value` to every current consumer of `topic`.
    ///
    /// Publishing to a topic nobody subscribed to does nothing. Consumers
    /// buffer without bound, so a slow consumer never holds up the others.
    pub async fn publish<T>(&self, topic: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.publish_payload(topic, Arc::new(value)).await;
    }

    /// Deliver an already type-erased payload.
    pub async fn publish_payload(&self, topic: impl Into<String>, value: Payload) {
        let _ = self.tx.send(EngineCommand::Publish {
            topic: topic.into(),
            value,
        });
    }

    /// Finish every consumer of `topic` and drop the topic.
    pub async fn close(&self, topic: impl Into<String>) {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(EngineCommand::Close {
                topic: topic.into(),
                reply,
            })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Number of topics in the registry.
    pub async fn topic_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EngineCommand::TopicCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Number of consumers currently attached to `topic`.
    pub async fn consumer_count(&self, topic: impl Into<String>) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(EngineCommand::ConsumerCount {
                topic: topic.into(),
                reply,
            })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("running", &!self.tx.is_closed())
            .finish()
    }
}

async fn run_engine(mut rx: mpsc::UnboundedReceiver<EngineCommand>) {
    let mut topics: HashMap<String, TopicHandle> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            EngineCommand::Subscribe { topic, reply } => {
                let handle = topics
                    .entry(topic)
                    .or_insert_with_key(|name| {
                        debug!(topic = %name, "topic created");
                        gauge!(PUBSUB_TOPICS_ACTIVE).increment(1.0);
                        TopicHandle::spawn(name)
                    })
                    .clone();
                let _ = reply.send(handle);
            }
            EngineCommand::Publish { topic, value } => {
                counter!(PUBSUB_PUBLISHES_TOTAL).increment(1);
                if let Some(handle) = topics.get(&topic) {
                    handle.publish(value);
                }
            }
            EngineCommand::Close { topic, reply } => {
                if let Some(handle) = topics.remove(&topic) {
                    handle.close();
                    gauge!(PUBSUB_TOPICS_ACTIVE).decrement(1.0);
                }
                let _ = reply.send(());
            }
            EngineCommand::TopicCount { reply } => {
                let _ = reply.send(topics.len());
            }
            EngineCommand::ConsumerCount { topic, reply } => match topics.get(&topic) {
                Some(handle) => handle.consumer_count(reply),
                None => {
                    let _ = reply.send(0);
                }
            },
        }
    }
    debug!("pubsub engine stopped");
}
