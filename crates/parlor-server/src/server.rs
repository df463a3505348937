use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{Json, Response};
use axum::routing::get;
use axum::Router;
use parlor_store::ChatStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{run_connection, ConnectionSettings};
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::fanout::Fanout;
use crate::health::{self, HealthResponse};
use crate::registry::{PresenceRegistry, Registry};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<Registry>,
    pub settings: ConnectionSettings,
    pub shutdown: CancellationToken,
    pub start_time: Instant,
    pub max_message_size: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.connection_count(),
        state.registry.online_user_count(),
    ))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let AppState {
        dispatcher,
        settings,
        shutdown,
        max_message_size,
        ..
    } = state;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| run_connection(socket, dispatcher, settings, shutdown))
}

/// A running server. Dropping the handle leaves the server running.
pub struct ServerHandle {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting, close every connection, and wait for the listener to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "server task failed");
        }
    }
}

/// Bind the listener and serve until the handle is shut down.
pub async fn start(config: ServerConfig, store: Arc<dyn ChatStore>) -> Result<ServerHandle, ServerError> {
    config.validate()?;
    let addr = config.bind_addr()?;
    if config.uses_default_secret() {
        warn!("serving with the default auth_secret; set PARLOR_AUTH_SECRET");
    }

    let registry = Arc::new(Registry::new(Fanout::new()));
    let dispatcher = Arc::new(Dispatcher::from_config(
        &config,
        store,
        Arc::clone(&registry) as Arc<dyn PresenceRegistry>,
    ));
    let shutdown = CancellationToken::new();

    let state = AppState {
        dispatcher,
        registry: Arc::clone(&registry),
        settings: ConnectionSettings::from_config(&config),
        shutdown: shutdown.clone(),
        start_time: Instant::now(),
        max_message_size: config.max_message_size,
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "listening");

    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = served {
            error!(error = %e, "server error");
        }
        info!("server stopped");
    });

    Ok(ServerHandle {
        addr,
        registry,
        shutdown,
        task,
    })
}
