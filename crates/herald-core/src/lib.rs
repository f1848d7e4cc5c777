//! # herald-core
//!
//! Foundation types shared by every Herald crate:
//!
//! - **Branded IDs**: `ConnectionId`, `ConsumerId` as newtypes for type safety
//! - **GraphQL values**: `GraphQLRequest`, `GraphQLResult`, `GraphQLError`
//! - **Operation kinds**: query / mutation / subscription detection
//! - **Protocol**: the `{id, type, payload}` envelope and the two supported
//!   WebSocket subprotocols
//! - **Errors**: `HeraldError` hierarchy via `thiserror`
//! - **Logging**: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod errors;
pub mod graphql;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::{ExecutionError, HeraldError, ProtocolError, RequestParseError, Result};
pub use graphql::{GraphQLError, GraphQLRequest, GraphQLResult, OperationKind};
pub use ids::{ConnectionId, ConsumerId};
pub use protocol::{ClientMessage, Envelope, SubProtocol};
