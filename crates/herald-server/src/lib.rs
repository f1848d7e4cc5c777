//! # herald-server
//!
//! The subscription-transport core and its Axum front end.
//!
//! - [`router`]: the connection registry actor; every write to a client
//!   passes through it
//! - [`operations`]: one actor per connection multiplexing its long-running
//!   operations
//! - [`execution`]: the seam to an opaque GraphQL engine
//! - [`websocket`]: per-socket sessions speaking `graphql-transport-ws` or
//!   `graphql-ws`
//! - [`http`]: `GET`/`POST` GraphQL over HTTP
//! - Health and Prometheus endpoints, graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod execution;
pub mod health;
pub mod http;
pub mod metrics;
pub mod operations;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;

pub use errors::ServerError;
pub use execution::{GraphQLExecutor, RequestInfo, ResultStream};
pub use router::{Router, RouterHandle, RouterStats};
pub use server::{HeraldServer, init_logging};
