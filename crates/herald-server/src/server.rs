//! `HeraldServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router as AxumRouter;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use herald_core::{ConnectionId, logging, protocol};
use herald_pubsub::PubSub;
use herald_settings::{HeraldSettings, LoggingSettings, ServerSettings};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::errors::ServerError;
use crate::execution::{GraphQLExecutor, RequestInfo};
use crate::health::{self, HealthResponse};
use crate::http;
use crate::router::{Router, RouterHandle};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{SessionState, run_ws_session};

/// Shared state accessible from Axum handlers.
pub struct AppState<E: GraphQLExecutor> {
    /// GraphQL engine.
    pub executor: Arc<E>,
    /// Router inbox.
    pub router: RouterHandle<E::Context>,
    /// Server settings.
    pub settings: Arc<ServerSettings>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Topic engine, reported by `/health` when present.
    pub pubsub: Option<PubSub>,
    /// Prometheus handle, served on `/metrics` when present.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

impl<E: GraphQLExecutor> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            router: self.router.clone(),
            settings: Arc::clone(&self.settings),
            shutdown: Arc::clone(&self.shutdown),
            pubsub: self.pubsub.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        }
    }
}

impl<E: GraphQLExecutor> AppState<E> {
    fn session_state(&self) -> SessionState<E> {
        SessionState {
            executor: Arc::clone(&self.executor),
            router: self.router.clone(),
            keep_alive: self.settings.keep_alive_interval(),
            send_queue_capacity: self.settings.send_queue_capacity,
            shutdown: self.shutdown.token(),
        }
    }
}

/// The main Herald server.
pub struct HeraldServer<E: GraphQLExecutor> {
    settings: Arc<ServerSettings>,
    executor: Arc<E>,
    router: RouterHandle<E::Context>,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pubsub: Option<PubSub>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl<E: GraphQLExecutor> HeraldServer<E> {
    /// Validate `settings`, then create a server and spawn its router.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(settings: ServerSettings, executor: E) -> Result<Self, ServerError> {
        settings.validate()?;
        let executor = Arc::new(executor);
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let (router, router_task) = Router::spawn(Arc::clone(&executor), shutdown.child_token());
        Ok(Self {
            settings: Arc::new(settings),
            executor,
            router,
            shutdown,
            tasks: Mutex::new(vec![router_task]),
            pubsub: None,
            metrics: None,
            start_time: Instant::now(),
        })
    }

    /// Create a server from the `server` section of `settings`.
    pub fn from_settings(settings: &HeraldSettings, executor: E) -> Result<Self, ServerError> {
        Self::new(settings.server.clone(), executor)
    }

    /// Install the global Prometheus recorder and serve it on `/metrics`.
    pub fn install_metrics(self) -> Result<Self, ServerError> {
        let handle = crate::metrics::install_recorder()?;
        Ok(self.with_metrics(handle))
    }

    /// Report topic counts from `pubsub` on `/health`.
    #[must_use]
    pub fn with_pubsub(mut self, pubsub: PubSub) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> AxumRouter {
        let state = AppState {
            executor: Arc::clone(&self.executor),
            router: self.router.clone(),
            settings: Arc::clone(&self.settings),
            shutdown: Arc::clone(&self.shutdown),
            pubsub: self.pubsub.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        let mut app = AxumRouter::new()
            .route(&self.settings.websocket_path, any(ws_handler::<E>))
            .route("/health", get(health_handler::<E>))
            .route("/metrics", get(metrics_handler::<E>));
        if self.settings.http_enabled {
            app = app.route(
                &self.settings.graphql_path,
                get(http::graphql_get::<E>)
                    .post(http::graphql_post::<E>)
                    .fallback(http::unsupported_method),
            );
        }

        app.with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the port is `0`.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(self.settings.bind_address()).await?;
        let addr = listener.local_addr()?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown.token();

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(error) = served {
                error!(error = %error, "server stopped unexpectedly");
            }
        });
        self.tasks.lock().push(task);

        info!(%addr, "herald server listening");
        Ok(addr)
    }

    /// Signal shutdown and wait for the router and listeners to stop.
    ///
    /// Open WebSocket sessions are closed with `1001`.
    pub async fn shutdown_gracefully(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        self.shutdown
            .graceful_shutdown(tasks, self.settings.shutdown_timeout())
            .await;
    }

    /// Get the router handle.
    pub fn router_handle(&self) -> &RouterHandle<E::Context> {
        &self.router
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Get the GraphQL executor.
    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }
}

/// Install the global tracing subscriber described by `settings`.
pub fn init_logging(settings: &LoggingSettings) {
    if settings.json {
        logging::init_json_subscriber(&settings.level);
    } else {
        logging::init_subscriber(&settings.level);
    }
}

/// `{websocket_path}`: upgrade and hand the socket to a session.
async fn ws_handler<E: GraphQLExecutor>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<E>>,
    info: RequestInfo,
) -> Response {
    let offered = info
        .headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok());
    let protocol = protocol::negotiate(offered);
    let session = state.session_state();

    ws.protocols([protocol.name()])
        .max_message_size(state.settings.max_message_size)
        .on_upgrade(move |socket| {
            run_ws_session(socket, ConnectionId::new(), protocol, info, session)
        })
}

/// GET /health
async fn health_handler<E: GraphQLExecutor>(
    State(state): State<AppState<E>>,
) -> Json<HealthResponse> {
    let stats = state.router.stats().await;
    let topics = match &state.pubsub {
        Some(pubsub) => Some(pubsub.topic_count().await),
        None => None,
    };
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        stats.connections,
        stats.executors,
        topics,
    ))
}

/// GET /metrics
async fn metrics_handler<E: GraphQLExecutor>(State(state): State<AppState<E>>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ChatExecutor;
    use assert_matches::assert_matches;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> HeraldServer<ChatExecutor> {
        HeraldServer::new(ServerSettings::default(), ChatExecutor::new(PubSub::new())).unwrap()
    }

    async fn request(app: AxumRouter, uri: &str) -> Response {
        app.oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn init_logging_accepts_both_formats() {
        init_logging(&LoggingSettings::default());
        init_logging(&LoggingSettings {
            json: true,
            ..LoggingSettings::default()
        });
    }

    #[tokio::test]
    async fn server_with_default_settings() {
        let server = make_server();
        assert_eq!(server.settings().port, 4000);
        assert_eq!(server.router_handle().stats().await.connections, 0);
        assert!(!server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn from_settings_rejects_invalid_paths() {
        let mut settings = HeraldSettings::default();
        settings.server.websocket_path = settings.server.graphql_path.clone();
        let result = HeraldServer::from_settings(&settings, ChatExecutor::new(PubSub::new()));
        assert_matches!(result.err(), Some(ServerError::Settings(_)));

        let server =
            HeraldServer::from_settings(&HeraldSettings::default(), ChatExecutor::new(PubSub::new()))
                .unwrap();
        assert_eq!(server.settings().graphql_path, "/graphql");
    }

    #[tokio::test]
    async fn new_rejects_colliding_routes() {
        for settings in [
            ServerSettings {
                websocket_path: "/graphql".into(),
                ..ServerSettings::default()
            },
            ServerSettings {
                graphql_path: "graphql".into(),
                ..ServerSettings::default()
            },
            ServerSettings {
                websocket_path: "/health".into(),
                ..ServerSettings::default()
            },
        ] {
            let result = HeraldServer::new(settings, ChatExecutor::new(PubSub::new()));
            assert_matches!(result.err(), Some(ServerError::Settings(_)));
        }
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let resp = request(server.router(), "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert!(parsed.get("topics").is_none());
    }

    #[tokio::test]
    async fn health_reports_topics_with_pubsub() {
        let pubsub = PubSub::new();
        let _stream = pubsub.subscribe("chat").await;
        let server = HeraldServer::new(ServerSettings::default(), ChatExecutor::new(pubsub.clone()))
            .unwrap()
            .with_pubsub(pubsub);

        let parsed = body_json(request(server.router(), "/health").await).await;
        assert_eq!(parsed["topics"], 1);
    }

    #[tokio::test]
    async fn health_reports_shutting_down() {
        let server = make_server();
        server.shutdown().shutdown();
        let parsed = body_json(request(server.router(), "/health").await).await;
        assert_eq!(parsed["status"], "shutting_down");
    }

    #[tokio::test]
    async fn metrics_endpoint_requires_handle() {
        let server = make_server();
        let resp = request(server.router(), "/metrics").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = make_server().with_metrics(handle);
        let resp = request(server.router(), "/metrics").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn websocket_path_requires_upgrade() {
        let server = make_server();
        let resp = request(server.router(), "/graphql/websocket").await;
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn http_routes_can_be_disabled() {
        let settings = ServerSettings {
            http_enabled: false,
            ..ServerSettings::default()
        };
        let server = HeraldServer::new(settings, ChatExecutor::new(PubSub::new())).unwrap();
        let resp = request(server.router(), "/graphql?query=%7Bhello%7D").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let resp = request(server.router(), "/nonexistent").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port_and_shuts_down() {
        let settings = ServerSettings {
            port: 0,
            ..ServerSettings::default()
        };
        let server = HeraldServer::new(settings, ChatExecutor::new(PubSub::new())).unwrap();
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        tokio::time::timeout(std::time::Duration::from_secs(5), server.shutdown_gracefully())
            .await
            .unwrap();
        assert!(server.shutdown().is_shutting_down());
    }
}
