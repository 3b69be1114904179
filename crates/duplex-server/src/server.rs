use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use duplex_telemetry::MetricsRecorder;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::handlers;
use crate::relay::Relay;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: Arc<MetricsRecorder>) -> Self {
        let relay = Arc::new(Relay::from_config(&config, metrics));
        Self {
            relay,
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index_handler))
        .route("/events", get(handlers::events_handler))
        .route("/response", post(handlers::response_handler))
        .route("/trigger", get(handlers::trigger_handler))
        .route("/dispatch", post(handlers::dispatch_handler))
        .route("/clients", get(handlers::clients_handler))
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = config.bind_addr();
    let state = AppState::new(config, metrics);
    let relay = Arc::clone(&state.relay);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "Duplex relay listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "Server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        relay,
        shutdown,
        server,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    pub port: u16,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Close every session, fail every waiting dispatch with
    /// `Cancelled(Shutdown)`, then stop accepting connections.
    pub async fn shutdown(self) {
        self.relay.shutdown();
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "Server task did not join cleanly");
        }
    }
}
