//! Seam to the GraphQL execution engine.
//!
//! Schema, parsing and resolution live behind [`GraphQLExecutor`]. The
//! transport only needs to build a per-connection context, run one-shot
//! operations, and turn long-running ones into a stream of results.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use futures::StreamExt;
use futures::stream::BoxStream;
use herald_core::{ExecutionError, GraphQLRequest, GraphQLResult, OperationKind};
use serde_json::Value;

/// Results of a long-running operation, in the order they are produced.
pub type ResultStream = BoxStream<'static, GraphQLResult>;

/// The request that opened a connection or carried an HTTP operation.
#[derive(Clone, Debug, Default)]
pub struct RequestInfo {
    /// Request headers.
    pub headers: HeaderMap,
    /// Peer address, when the listener records it.
    pub remote_addr: Option<SocketAddr>,
}

impl RequestInfo {
    /// A header value as text, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestInfo {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self {
            headers: parts.headers.clone(),
            remote_addr,
        })
    }
}

/// An opaque GraphQL engine.
///
/// Failures are returned as [`ExecutionError`]; the transport turns them
/// into `{"errors": [...]}` payloads and never propagates them further.
#[async_trait]
pub trait GraphQLExecutor: Send + Sync + 'static {
    /// Application context handed to every resolver on a connection.
    type Context: Clone + Send + Sync + 'static;

    /// Build the context for a new connection (or HTTP request).
    ///
    /// `init_payload` is the `connection_init` payload on WebSocket
    /// connections and `None` over HTTP. An error rejects the connection.
    async fn build_context(
        &self,
        info: &RequestInfo,
        init_payload: Option<&Value>,
    ) -> Result<Self::Context, ExecutionError>;

    /// Classify a request before it is routed.
    ///
    /// Only [`OperationKind::Subscription`] is streamed through
    /// [`subscribe`](Self::subscribe); everything else, `None` included,
    /// runs once through [`execute`](Self::execute). The default reads the
    /// operation out of the document with [`GraphQLRequest::operation_kind`].
    fn operation_kind(&self, request: &GraphQLRequest) -> Option<OperationKind> {
        request.operation_kind()
    }

    /// Run a query or mutation to a single result.
    async fn execute(
        &self,
        request: GraphQLRequest,
        context: Self::Context,
        info: Arc<RequestInfo>,
    ) -> Result<GraphQLResult, ExecutionError>;

    /// Resolve a long-running operation to a stream of results.
    ///
    /// The stream is dropped when the operation is stopped, which must
    /// release whatever it holds (topic subscriptions included). The default
    /// yields the single result of [`execute`](Self::execute).
    async fn subscribe(
        &self,
        request: GraphQLRequest,
        context: Self::Context,
        info: Arc<RequestInfo>,
    ) -> Result<ResultStream, ExecutionError> {
        let result = self.execute(request, context, info).await?;
        Ok(futures::stream::once(async move { result }).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use serde_json::json;

    struct Constant;

    #[async_trait]
    impl GraphQLExecutor for Constant {
        type Context = ();

        async fn build_context(
            &self,
            _info: &RequestInfo,
            _init_payload: Option<&Value>,
        ) -> Result<(), ExecutionError> {
            Ok(())
        }

        async fn execute(
            &self,
            request: GraphQLRequest,
            _context: (),
            _info: Arc<RequestInfo>,
        ) -> Result<GraphQLResult, ExecutionError> {
            if request.query.contains("broken") {
                return Err(ExecutionError::Validation("Cannot query field \"broken\"".into()));
            }
            Ok(GraphQLResult::data(json!({"value": 1})))
        }
    }

    #[test]
    fn default_operation_kind_reads_document() {
        assert_eq!(
            Constant.operation_kind(&GraphQLRequest::new("subscription { ticks }")),
            Some(OperationKind::Subscription)
        );
        assert_eq!(
            Constant.operation_kind(&GraphQLRequest::new("{ value }")),
            Some(OperationKind::Query)
        );
        assert_eq!(Constant.operation_kind(&GraphQLRequest::new("")), None);
    }

    #[tokio::test]
    async fn default_subscribe_yields_single_result() {
        let results: Vec<GraphQLResult> = Constant
            .subscribe(GraphQLRequest::new("{ value }"), (), Arc::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(results, vec![GraphQLResult::data(json!({"value": 1}))]);
    }

    #[tokio::test]
    async fn default_subscribe_propagates_error() {
        let err = Constant
            .subscribe(GraphQLRequest::new("{ broken }"), (), Arc::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Cannot query field \"broken\"");
    }

    #[tokio::test]
    async fn request_info_extracts_headers_and_peer() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let request = Request::builder()
            .header("authorization", "Bearer t")
            .extension(ConnectInfo(addr))
            .body(())
            .unwrap();
        let (mut parts, ()) = request.into_parts();

        let info = RequestInfo::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(info.header("authorization"), Some("Bearer t"));
        assert_eq!(info.remote_addr, Some(addr));
    }

    #[tokio::test]
    async fn request_info_without_peer() {
        let (mut parts, ()) = Request::builder().body(()).unwrap().into_parts();
        let info = RequestInfo::from_request_parts(&mut parts, &()).await.unwrap();
        assert!(info.remote_addr.is_none());
        assert!(info.header("authorization").is_none());
    }
}
