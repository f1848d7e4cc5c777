//! Consumer-side streams.

use std::any::Any;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use herald_core::ConsumerId;
use tokio::sync::mpsc;
use tracing::trace;

use crate::topic::{Payload, TopicHandle};

/// Releases a consumer registration exactly once.
struct ConsumerGuard {
    id: ConsumerId,
    topic: Option<TopicHandle>,
}

impl ConsumerGuard {
    fn release(&mut self) {
        if let Some(topic) = self.topic.take() {
            trace!(topic = topic.name(), consumer_id = %self.id, "releasing consumer");
            topic.unsubscribe(self.id.clone());
        }
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// One subscriber's view of a topic.
///
/// Yields every payload published to the topic after the subscription was
/// registered, and ends when the topic is closed. Dropping the stream, or
/// letting it run to its end, unregisters the consumer; the first of those
/// wins and the rest are no-ops.
pub struct ConsumerStream {
    rx: mpsc::UnboundedReceiver<Payload>,
    guard: ConsumerGuard,
}

impl ConsumerStream {
    pub(crate) fn new(
        id: ConsumerId,
        topic: Option<TopicHandle>,
        rx: mpsc::UnboundedReceiver<Payload>,
    ) -> Self {
        Self {
            rx,
            guard: ConsumerGuard { id, topic },
        }
    }

    /// Consumer id assigned at subscribe time.
    pub fn id(&self) -> &ConsumerId {
        &self.guard.id
    }

    /// Unregister now and discard anything still buffered.
    pub fn unsubscribe(mut self) {
        self.guard.release();
    }

    /// Keep only payloads of type `T`.
    pub fn typed<T>(self) -> TypedStream<T>
    where
        T: Any + Clone + Send + Sync,
    {
        TypedStream {
            inner: self,
            _marker: PhantomData,
        }
    }
}

impl Stream for ConsumerStream {
    type Item = Payload;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Payload>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(None) => {
                this.guard.release();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for ConsumerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerStream")
            .field("id", &self.guard.id)
            .field("topic", &self.guard.topic.as_ref().map(TopicHandle::name))
            .finish()
    }
}

/// A consumer stream filtered to one payload type.
///
/// Payloads of any other type are skipped silently, so several event shapes
/// can share one topic name.
pub struct TypedStream<T> {
    inner: ConsumerStream,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedStream<T> {
    /// Consumer id of the underlying subscription.
    pub fn id(&self) -> &ConsumerId {
        self.inner.id()
    }
}

impl<T> Stream for TypedStream<T>
where
    T: Any + Clone + Send + Sync,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(payload)) => {
                    if let Some(value) = payload.downcast_ref::<T>() {
                        return Poll::Ready(Some(value.clone()));
                    }
                    trace!(consumer_id = %this.inner.id(), "skipping payload of another type");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
