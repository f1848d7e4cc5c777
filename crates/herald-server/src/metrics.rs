//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup,
/// before anything is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections opened (counter, labels: protocol).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Client frames the subprotocol could not decode (counter).
pub const WS_PROTOCOL_ERRORS_TOTAL: &str = "ws_protocol_errors_total";
/// Operations started (counter, labels: kind).
pub const OPERATIONS_TOTAL: &str = "graphql_operations_total";
/// Running long-lived operations (gauge).
pub const OPERATIONS_ACTIVE: &str = "graphql_operations_active";
/// Operations that ended with an execution error (counter).
pub const OPERATION_ERRORS_TOTAL: &str = "graphql_operation_errors_total";
/// Envelopes queued to clients (counter).
pub const ENVELOPES_SENT_TOTAL: &str = "envelopes_sent_total";
/// Envelopes dropped on a full or closed send queue (counter).
pub const ENVELOPES_DROPPED_TOTAL: &str = "envelopes_dropped_total";
/// GraphQL-over-HTTP requests (counter, labels: method, status).
pub const HTTP_REQUESTS_TOTAL: &str = "graphql_http_requests_total";
