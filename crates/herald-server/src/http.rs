//! GraphQL over HTTP: `GET` with query-string parameters and `POST` with a
//! JSON body.
//!
//! Rejections carry a `{"errors": [{"message": ...}]}` body. For requests
//! that parse as JSON but are not GraphQL requests, the status depends on
//! the client: `400` when it accepts `application/graphql-response+json`,
//! `200` otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use herald_core::{GraphQLRequest, GraphQLResult, RequestParseError};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::execution::{GraphQLExecutor, RequestInfo};
use crate::metrics::HTTP_REQUESTS_TOTAL;
use crate::server::AppState;

/// Media type of the GraphQL-over-HTTP response format.
pub const GRAPHQL_RESPONSE_JSON: &str = "application/graphql-response+json";

/// Rejection message for a `GET` without `query`.
pub const MISSING_GET_QUERY: &str = "Unable to parse query and identify operation. Specify the 'query' query string parameter with the GraphQL query.";

/// An HTTP request that never reached the executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    /// Response status.
    pub status: StatusCode,
    /// Error message.
    pub message: String,
}

impl Rejection {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, Json(GraphQLResult::error(self.message))).into_response()
    }
}

/// Build a request from `GET` query-string parameters.
///
/// `variables` that are not a JSON object are ignored.
pub fn parse_get(params: &HashMap<String, String>) -> Result<GraphQLRequest, Rejection> {
    let Some(query) = params.get("query") else {
        return Err(Rejection::new(StatusCode::BAD_REQUEST, MISSING_GET_QUERY));
    };
    let variables = params
        .get("variables")
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|value| match value {
            Value::Object(vars) => Some(vars),
            _ => None,
        });
    Ok(GraphQLRequest {
        query: query.clone(),
        operation_name: params.get("operationName").cloned(),
        variables,
    })
}

/// Build a request from a `POST` body.
pub fn parse_post(headers: &HeaderMap, body: &[u8]) -> Result<GraphQLRequest, Rejection> {
    let has_content_type = headers
        .get(CONTENT_TYPE)
        .is_some_and(|value| !value.is_empty());
    if !has_content_type {
        return Err(Rejection::new(StatusCode::BAD_REQUEST, "Invalid content-type"));
    }

    let strict = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|accept| accept.contains(GRAPHQL_RESPONSE_JSON));
    let form_status = if strict {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };

    GraphQLRequest::from_json(body).map_err(|error| {
        let status = match error {
            RequestParseError::MissingQuery | RequestParseError::InvalidForm => form_status,
            RequestParseError::InvalidJson(_) => StatusCode::BAD_REQUEST,
        };
        Rejection::new(status, error.to_string())
    })
}

/// `GET {graphql_path}`
pub(crate) async fn graphql_get<E: GraphQLExecutor>(
    State(state): State<AppState<E>>,
    info: RequestInfo,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let response = match parse_get(&params) {
        Ok(request) => execute(&state.executor, request, info).await,
        Err(rejection) => rejection.into_response(),
    };
    record("GET", response.status());
    response
}

/// `POST {graphql_path}`
pub(crate) async fn graphql_post<E: GraphQLExecutor>(
    State(state): State<AppState<E>>,
    info: RequestInfo,
    body: Bytes,
) -> Response {
    let response = match parse_post(&info.headers, &body) {
        Ok(request) => execute(&state.executor, request, info).await,
        Err(rejection) => rejection.into_response(),
    };
    record("POST", response.status());
    response
}

/// Any other method on `{graphql_path}`.
pub(crate) async fn unsupported_method() -> Response {
    record("OTHER", StatusCode::BAD_REQUEST);
    Rejection::new(
        StatusCode::BAD_REQUEST,
        "Invalid operation method for GraphQL request",
    )
    .into_response()
}

#[instrument(skip_all, fields(operation_name = request.operation_name.as_deref()))]
async fn execute<E: GraphQLExecutor>(
    executor: &Arc<E>,
    request: GraphQLRequest,
    info: RequestInfo,
) -> Response {
    let context = match executor.build_context(&info, None).await {
        Ok(context) => context,
        Err(error) => {
            warn!(error = %error, "http request rejected");
            return Rejection::new(StatusCode::FORBIDDEN, error.to_string()).into_response();
        }
    };
    let result = executor
        .execute(request, context, Arc::new(info))
        .await
        .unwrap_or_else(|error| {
            debug!(error = %error, "http operation failed");
            GraphQLResult::from(error)
        });
    (StatusCode::OK, Json(result)).into_response()
}

fn record(method: &'static str, status: StatusCode) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method,
        "status" => status.as_u16().to_string()
    )
    .increment(1);
}
