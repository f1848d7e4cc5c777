//! # herald-pubsub
//!
//! Topic-keyed publish/subscribe broadcast engine.
//!
//! - [`PubSub`]: cloneable handle to the engine actor, which owns the topic registry
//! - each topic is its own actor owning its consumer set
//! - [`ConsumerStream`]: one subscriber's unicast stream; dropping it unsubscribes
//! - [`TypedStream`]: a consumer stream that keeps only payloads of one type
//!
//! There is no process-wide instance: create a [`PubSub`] and hand clones to
//! whatever needs to publish or subscribe.

#![deny(unsafe_code)]

mod engine;
mod stream;
mod topic;

pub use engine::{PUBSUB_PUBLISHES_TOTAL, PUBSUB_TOPICS_ACTIVE, PubSub};
pub use stream::{ConsumerStream, TypedStream};
pub use topic::Payload;
