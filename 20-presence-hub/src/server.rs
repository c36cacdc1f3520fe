use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        Query, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    http::{Method, header},
    response::IntoResponse,
    routing::get,
};
use futures::StreamExt;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    config::{HubConfig, SessionConfig, resolve_identity},
    hub::{self, HubHandle},
    session::Session,
};

pub struct Server {
    listener: TcpListener,
    config: HubConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: HubConfig) -> Self {
        Self { listener, config }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves, then stops the hub so every session
    /// receives a close frame.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, config } = self;
        let (hub, hub_task) = hub::spawn(&config);
        let app = router(hub.clone(), config.session);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("presence hub shutting down");
                if let Err(err) = hub.shutdown().await {
                    warn!(error = %err, "hub already stopped");
                }
            })
            .await
            .context("server stopped unexpectedly")?;

        if let Err(err) = hub_task.await {
            warn!(error = ?err, "hub task panicked");
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    session: SessionConfig,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    username: Option<String>,
}

/// `/ws` for sessions, `/health` for liveness, and a permissive CORS banner
/// for everything else.
pub fn router(hub: HubHandle, session: SessionConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/ws", get(upgrade))
        .route("/health", get(health))
        .fallback(banner)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { hub, session })
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let username = resolve_identity(params.username.as_deref());
    ws.on_upgrade(move |socket| serve_socket(socket, username, state))
}

async fn serve_socket(socket: WebSocket, username: String, state: AppState) {
    let session = Session::new(state.hub, username, state.session);
    info!(session_id = session.id(), username = session.username(), "connection upgraded");
    let (sink, stream) = socket.split();
    session.run(sink, stream).await;
}

async fn health() -> &'static str {
    "OK"
}

async fn banner() -> &'static str {
    "presence hub"
}
