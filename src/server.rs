//!
//! sentinel HTTP/WS server
//! -----------------------
//! Axum router exposing the operator control channel.
//!
//! Responsibilities:
//! - `GET /control` upgrades to a WebSocket; one socket is one connection.
//!   Inbound text frames are JSON `Command`s, outbound frames are JSON `Event`s.
//! - `?access_token=` on the upgrade request re-authenticates a returning operator.
//! - `GET /health` reports connection and capture counters.
//! - Startup wiring of the credential store, proof store and capture collaborators.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::clock::SystemClock;
use crate::config::AgentConfig;
use crate::connection::ConnectionId;
use crate::identity::{AuthSessionManager, FileCredentialStore};
use crate::keylog::{select_key_source, KeyLogRegistry};
use crate::media::{CameraSlot, FfmpegCamera, ProofStore, ShellScreenCapture, WebcamStreamManager};
use crate::system::HostSystem;
use crate::system_paths;

pub mod commands;
pub mod dispatcher;
pub mod hub;

use commands::Command;
use dispatcher::{DispatchSettings, Dispatcher, Services};
use hub::ConnectionHub;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Default, Deserialize)]
struct ControlQuery {
    access_token: Option<String>,
}

fn log_startup_folders(cfg: &AgentConfig) {
    let cwd = std::env::current_dir().ok();
    let exe = std::env::current_exe().ok();
    let user = std::env::var("USER").or_else(|_| std::env::var("USERNAME")).ok();
    info!(
        target: "startup",
        "sentinel starting. cwd={:?}, exe={:?}, user={:?}, data_dir={:?}, data_dir_exists={}",
        cwd, exe, user, cfg.data_dir, cfg.data_dir.exists()
    );
    info!(target: "startup", "configuration: {:?}", cfg);
}

/// Wire the production collaborators for `cfg` into a dispatcher.
pub fn build_dispatcher(cfg: &AgentConfig) -> anyhow::Result<Arc<Dispatcher>> {
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("Failed to create or access data dir: {}", cfg.data_dir.display()))?;

    let credentials = Arc::new(FileCredentialStore::open(system_paths::users_file(&cfg.data_dir)));
    let proofs = Arc::new(
        ProofStore::open(system_paths::proofs_dir(&cfg.data_dir))
            .with_context(|| format!("While opening proof store under {}", cfg.data_dir.display()))?,
    );
    let hub = Arc::new(ConnectionHub::new());
    let camera = CameraSlot::new(Arc::new(FfmpegCamera::new(cfg.camera_device.clone())));

    let svc = Services {
        auth: Arc::new(AuthSessionManager::from_config(cfg, credentials, Arc::new(SystemClock))),
        hub: hub.clone(),
        webcam: Arc::new(WebcamStreamManager::new(camera, proofs.clone())),
        proofs,
        keylog: KeyLogRegistry::new(select_key_source(cfg.key_device.as_deref()), hub),
        screen: Arc::new(ShellScreenCapture),
        system: Arc::new(HostSystem::new()),
    };
    Ok(Arc::new(Dispatcher::new(svc, DispatchSettings::from_config(cfg))))
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/", get(|| async { "sentinel ok" }))
        .route("/health", get(health))
        .route("/control", get(control_handler))
        .with_state(AppState { dispatcher })
}

/// Start the agent and serve until ctrl-c.
pub async fn run(cfg: AgentConfig) -> anyhow::Result<()> {
    log_startup_folders(&cfg);
    let dispatcher = build_dispatcher(&cfg)?;
    let app = router(dispatcher);

    let addr: SocketAddr = format!("{}:{}", cfg.bind, cfg.http_port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", cfg.bind, cfg.http_port))?;
    info!(target: "startup", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("bind {}", addr))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "startup", "shutdown requested");
        })
        .await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.health())
}

async fn control_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<ControlQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(state.dispatcher, socket, peer, query.access_token))
}

async fn serve_connection(dispatcher: Arc<Dispatcher>, socket: WebSocket, peer: SocketAddr, access_token: Option<String>) {
    let conn = ConnectionId::generate();
    info!(target: "dispatch", conn = %conn, %peer, "control connection opened");
    let (mut sink, mut stream) = socket.split();
    let mut outbound = dispatcher.on_connect(&conn, access_token.as_deref());

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!(target: "dispatch", "event encode failed: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() { break; }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<Command>(text.as_str()) {
                Ok(cmd) => dispatcher.dispatch(&conn, peer.ip(), cmd).await,
                Err(e) => debug!(target: "dispatch", conn = %conn, "ignored malformed frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(target: "dispatch", conn = %conn, "socket error: {}", e);
                break;
            }
        }
    }

    dispatcher.on_disconnect(&conn).await;
    let _ = writer.await;
    info!(target: "dispatch", conn = %conn, "control connection closed");
}
