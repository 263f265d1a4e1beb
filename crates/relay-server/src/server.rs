//! `RelayServer`: Axum HTTP + WebSocket + push-stream server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::Identity;
use relay_hub::{Hub, push_stream, run_duplex_session};
use relay_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{Authenticator, TrustedHeaders};
use crate::error::ApiError;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The fan-out hub.
    pub hub: Hub,
    /// Identity resolver for `/ws` and `/events`.
    pub auth: Arc<dyn Authenticator>,
    /// Prometheus handle; `/metrics` is 404 without one.
    pub metrics: Option<PrometheusHandle>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
}

/// The relay HTTP server.
pub struct RelayServer {
    settings: ServerSettings,
    hub: Hub,
    auth: Arc<dyn Authenticator>,
    metrics: Option<PrometheusHandle>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl RelayServer {
    /// Server over `hub`, trusting gateway identity headers.
    pub fn new(settings: ServerSettings, hub: Hub) -> Self {
        Self {
            settings,
            shutdown: Arc::new(ShutdownCoordinator::new(hub.clone())),
            hub,
            auth: Arc::new(TrustedHeaders::default()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Replace the identity resolver.
    #[must_use]
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    /// Serve `/metrics` from this Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            auth: self.auth.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            max_message_size: self.settings.max_message_size,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/events", get(events_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind `host:port` and serve until shutdown. Returns the bound address
    /// and the serving task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%local_addr, "relay server listening");
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "server exited with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Shut down and wait for the serving task, bounded by the configured
    /// shutdown timeout.
    pub async fn shutdown_gracefully(&self, server: JoinHandle<()>) -> bool {
        self.shutdown
            .graceful_shutdown(vec![server], self.settings.shutdown_timeout())
            .await
    }

    /// The hub behind this server.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

async fn identity_of(state: &AppState, headers: &HeaderMap) -> Identity {
    state.auth.authenticate(headers).await.unwrap_or_default()
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = identity_of(&state, &headers).await;
    let admission = state.hub.admit_duplex(identity)?;
    let conn_id = admission.connection.id.clone();
    let hub = state.hub.clone();
    let failed_hub = state.hub.clone();

    Ok(ws
        .max_message_size(state.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!(conn_id = %conn_id, error = %e, "websocket upgrade failed");
            let _ = failed_hub.close_connection(&conn_id);
        })
        .on_upgrade(move |socket| run_duplex_session(hub, admission, socket)))
}

/// GET /events
async fn events_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = identity_of(&state, &headers).await;
    let admission = state.hub.admit_stream(identity)?;
    let body = Body::from_stream(push_stream(state.hub.clone(), admission));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (
                header::HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        body,
    )
        .into_response())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.stats(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
