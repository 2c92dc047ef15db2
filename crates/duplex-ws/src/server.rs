//! `DuplexServer`: axum listener feeding WebSocket upgrades into a Router.
//!
//! Every upgrade path other than `/health` and `/metrics` opens a Router
//! session bound to the endpoint at the normalized request path. Sessions
//! for paths with no endpoint still open; their calls fail with
//! method-not-found.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use duplex_core::normalize_endpoint_path;
use duplex_rpc::Router;
use duplex_settings::ServerSettings;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{info, instrument, warn};

use crate::channel::WsChannel;
use crate::health::{self, HealthResponse};
use crate::keepalive::spawn_keep_alive;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_REFUSED_TOTAL,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
struct AppState {
    router: Router,
    settings: Arc<ServerSettings>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    connections: Arc<AtomicUsize>,
    metrics: Option<PrometheusHandle>,
}

/// One reserved connection slot, given back on drop.
///
/// Reserved before the upgrade so concurrent upgrades cannot overshoot the
/// limit; dropped with the upgrade callback if the upgrade never completes.
struct ConnectionSlot {
    connections: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn try_reserve(connections: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < limit).then_some(open + 1)
            })
            .ok()
            .map(|_| Self {
                connections: connections.clone(),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// WebSocket listener for one Router.
pub struct DuplexServer {
    state: AppState,
}

impl DuplexServer {
    /// Create a server. Nothing is bound until [`listen`](Self::listen).
    pub fn new(settings: ServerSettings, router: Router) -> Self {
        Self {
            state: AppState {
                router,
                settings: Arc::new(settings),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                connections: Arc::new(AtomicUsize::new(0)),
                metrics: None,
            },
        }
    }

    /// Serve `/metrics` from this recorder handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the axum app with all routes.
    pub fn app(&self) -> axum::Router {
        axum::Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/", get(ws_handler))
            .route("/{*path}", get(ws_handler))
            .with_state(self.state.clone())
    }

    /// The Router sessions are opened on.
    pub fn router(&self) -> &Router {
        &self.state.router
    }

    /// Listener settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.state.settings
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Open WebSocket connections, including upgrades in progress.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::Acquire)
    }

    /// Bind and start serving. Returns the bound address.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let settings = &self.state.settings;
        let listener =
            tokio::net::TcpListener::bind((settings.host.as_str(), settings.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "duplex server listening");

        let app = self.app();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %e, "server stopped with error");
            }
        });
        self.state.shutdown.track(handle);
        Ok(local_addr)
    }

    /// Stop accepting, close every session, and wait for the listener.
    pub async fn stop(&self) -> ShutdownReport {
        let report = self
            .state
            .shutdown
            .graceful_shutdown(&self.state.router, self.state.settings.shutdown_timeout())
            .await;
        info!(?report, "duplex server stopped");
        report
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        state.connections.load(Ordering::Acquire),
        state.router.session_count(),
        state.router.dispatcher().endpoint_paths(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Any other path: WebSocket upgrade into a Router session.
async fn ws_handler(ws: WebSocketUpgrade, uri: Uri, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let Some(slot) = ConnectionSlot::try_reserve(&state.connections, state.settings.max_connections)
    else {
        counter!(WS_CONNECTIONS_REFUSED_TOTAL).increment(1);
        warn!(limit = state.settings.max_connections, "connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    let path = normalize_endpoint_path(uri.path());
    ws.max_message_size(state.settings.max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, path, state, slot))
        .into_response()
}

#[instrument(skip_all, fields(path = %path))]
async fn serve_socket(socket: WebSocket, path: String, state: AppState, slot: ConnectionSlot) {
    let (channel, events) = WsChannel::spawn(socket, format!("ws_{}", uuid::Uuid::now_v7()));
    if let Some(period) = state.settings.keep_alive() {
        let _ = spawn_keep_alive(channel.clone(), period);
    }

    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    let started = Instant::now();

    let (conn, session) = state.router.serve(channel, events, &path);
    info!(conn = %conn, "client connected");
    if let Err(e) = session.await {
        warn!(conn = %conn, error = %e, "session task failed");
        let _ = state.router.close(conn, "session task failed").await;
    }

    drop(slot);
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    info!(conn = %conn, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use duplex_rpc::{DispatchEngine, Endpoint};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> DuplexServer {
        let dispatcher = Arc::new(DispatchEngine::new());
        dispatcher
            .register_endpoint(Arc::new(Endpoint::new("main", "/")))
            .unwrap();
        DuplexServer::new(ServerSettings::default(), Router::new(dispatcher))
    }

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[test]
    fn server_with_default_settings() {
        let server = make_server();
        assert_eq!(server.settings().host, "127.0.0.1");
        assert_eq!(server.settings().port, 0);
        assert_eq!(server.connection_count(), 0);
        assert!(!server.shutdown().is_shutting_down());
    }

    #[test]
    fn connection_slots_stop_at_the_limit() {
        let connections = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::try_reserve(&connections, 2).unwrap();
        let _second = ConnectionSlot::try_reserve(&connections, 2).unwrap();
        assert!(ConnectionSlot::try_reserve(&connections, 2).is_none());
        assert_eq!(connections.load(Ordering::Acquire), 2);

        drop(first);
        assert_eq!(connections.load(Ordering::Acquire), 1);
        assert!(ConnectionSlot::try_reserve(&connections, 2).is_some());
        assert_eq!(connections.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overshoot() {
        let connections = Arc::new(AtomicUsize::new(0));
        let attempts: Vec<_> = (0..32)
            .map(|_| {
                let connections = connections.clone();
                tokio::spawn(async move { ConnectionSlot::try_reserve(&connections, 5) })
            })
            .collect();
        let mut held = Vec::new();
        for attempt in attempts {
            if let Some(slot) = attempt.await.unwrap() {
                held.push(slot);
            }
        }
        assert_eq!(held.len(), 5);
        assert_eq!(connections.load(Ordering::Acquire), 5);
        drop(held);
        assert_eq!(connections.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn health_endpoint_reports_counters() {
        let server = make_server();
        let (status, json) = get_json(server.app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
        assert_eq!(json["active_sessions"], 0);
        assert_eq!(json["endpoints"][0], "/");
    }

    #[tokio::test]
    async fn health_reports_draining_after_shutdown() {
        let server = make_server();
        server.shutdown().shutdown();
        let (_, json) = get_json(server.app(), "/health").await;
        assert_eq!(json["status"], "draining");
    }

    #[tokio::test]
    async fn metrics_endpoint_needs_a_recorder() {
        let server = make_server();
        let resp = server
            .app()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = make_server().with_metrics(handle);
        let resp = server
            .app()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plain_get_on_endpoint_path_is_not_upgraded() {
        let server = make_server();
        let resp = server
            .app()
            .oneshot(Request::builder().uri("/admin").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn listen_binds_an_ephemeral_port_and_stops() {
        let server = make_server();
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        let report = server.stop().await;
        assert_eq!(report.tasks, 1);
        assert!(!report.timed_out);
        assert!(server.shutdown().is_shutting_down());
    }
}
