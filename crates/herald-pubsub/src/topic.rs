//! Topic actor: owns the consumer set for one topic key.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use herald_core::ConsumerId;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// An untyped published value.
pub type Payload = Arc<dyn Any + Send + Sync>;

pub(crate) enum TopicCommand {
    Subscribe {
        id: ConsumerId,
        tx: mpsc::UnboundedSender<Payload>,
    },
    Unsubscribe {
        id: ConsumerId,
    },
    Publish {
        value: Payload,
    },
    Close,
    ConsumerCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Inbox of a running topic actor.
#[derive(Clone)]
pub(crate) struct TopicHandle {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<TopicCommand>,
}

impl TopicHandle {
    /// Spawn a topic actor with no consumers.
    pub(crate) fn spawn(name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = Topic {
            name: Arc::from(name),
            consumers: HashMap::new(),
        };
        let handle = Self {
            name: topic.name.clone(),
            tx,
        };
        drop(tokio::spawn(topic.run(rx)));
        handle
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Register a consumer. If the topic already closed, `tx` is dropped and
    /// the consumer's stream ends right away.
    pub(crate) fn subscribe(&self, id: ConsumerId, tx: mpsc::UnboundedSender<Payload>) {
        let _ = self.tx.send(TopicCommand::Subscribe { id, tx });
    }

    pub(crate) fn unsubscribe(&self, id: ConsumerId) {
        let _ = self.tx.send(TopicCommand::Unsubscribe { id });
    }

    pub(crate) fn publish(&self, value: Payload) {
        let _ = self.tx.send(TopicCommand::Publish { value });
    }

    pub(crate) fn close(&self) {
        let _ = self.tx.send(TopicCommand::Close);
    }

    pub(crate) fn consumer_count(&self, reply: oneshot::Sender<usize>) {
        if let Err(mpsc::error::SendError(TopicCommand::ConsumerCount { reply })) =
            self.tx.send(TopicCommand::ConsumerCount { reply })
        {
            let _ = reply.send(0);
        }
    }
}

struct Topic {
    name: Arc<str>,
    consumers: HashMap<ConsumerId, mpsc::UnboundedSender<Payload>>,
}

impl Topic {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TopicCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                TopicCommand::Subscribe { id, tx } => {
                    trace!(topic = %self.name, consumer_id = %id, "consumer attached");
                    let _ = self.consumers.insert(id, tx);
                }
                TopicCommand::Unsubscribe { id } => {
                    if self.consumers.remove(&id).is_some() {
                        trace!(topic = %self.name, consumer_id = %id, "consumer detached");
                    }
                }
                TopicCommand::Publish { value } => self.publish(&value),
                TopicCommand::Close => {
                    debug!(
                        topic = %self.name,
                        consumers = self.consumers.len(),
                        "topic closed"
                    );
                    // dropping the senders finishes every consumer stream
                    self.consumers.clear();
                    break;
                }
                TopicCommand::ConsumerCount { reply } => {
                    let _ = reply.send(self.consumers.len());
                }
            }
        }
    }

    fn publish(&mut self, value: &Payload) {
        let before = self.consumers.len();
        self.consumers
            .retain(|_, tx| tx.send(Arc::clone(value)).is_ok());
        let pruned = before - self.consumers.len();
        trace!(
            topic = %self.name,
            recipients = self.consumers.len(),
            pruned,
            "published to topic"
        );
    }
}
