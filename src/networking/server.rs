use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::interface;
use super::relay::RelayServer;
use super::session::PeerSession;
use crate::config::RelayConfig;
use crate::protocol::{Frame, PeerSummary};

#[derive(Clone)]
struct AppState {
    relay: Arc<RelayServer>,
    shutdown: watch::Receiver<bool>,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub peers: Vec<PeerSummary>,
    pub count: usize,
}

/// Body of `GET /ip`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpResponse {
    pub ip: String,
}

/// A relay listening in the background
pub struct RunningRelay {
    pub addr: SocketAddr,
    pub relay: Arc<RelayServer>,
    server: JoinHandle<Result<()>>,
    sweeper: JoinHandle<()>,
}

impl RunningRelay {
    /// WebSocket URL clients connect to
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, self.relay.config().relay_path)
    }

    /// Wait for the server to drain after shutdown was signalled
    pub async fn wait(self) -> Result<()> {
        let result = self.server.await.context("Relay server task panicked")?;
        let _ = self.sweeper.await;
        result
    }
}

/// HTTP routes: the WebSocket upgrade at the relay path, plus `/status` and `/ip`
pub fn router(relay: Arc<RelayServer>, shutdown: watch::Receiver<bool>) -> Router {
    let relay_path = relay.config().relay_path.clone();
    Router::new()
        .route(&relay_path, get(ws_handler))
        .route("/status", get(status_handler))
        .route("/ip", get(ip_handler))
        .with_state(AppState { relay, shutdown })
}

/// Bind the listener and serve until `shutdown` flips to true
pub async fn start_relay_server(
    config: RelayConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<RunningRelay> {
    let listener = TcpListener::bind(config.socket_addr())
        .await
        .with_context(|| format!("Failed to bind relay to {}", config.socket_addr()))?;
    let addr = listener.local_addr()?;

    let relay = Arc::new(RelayServer::new(config));
    let sweeper = relay.spawn_sweeper(shutdown.clone());
    let app = router(relay.clone(), shutdown.clone());

    info!(
        "Relay listening on {} (WebSocket path {})",
        addr,
        relay.config().relay_path
    );

    let mut signal = shutdown;
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            stopped(&mut signal).await;
            info!("Relay shutting down");
        })
        .await
        .context("Relay server failed")
    });

    Ok(RunningRelay {
        addr,
        relay,
        server,
        sweeper,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket, remote))
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let peers = state.relay.active_peers();
    Json(StatusResponse {
        count: peers.len(),
        peers,
    })
}

async fn ip_handler() -> Result<Json<IpResponse>, StatusCode> {
    match interface::best_lan_address() {
        Ok(ip) => Ok(Json(IpResponse { ip: ip.to_string() })),
        Err(e) => {
            error!("Failed to determine LAN address: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Pump one WebSocket through a fresh session until either side closes
async fn handle_socket(state: AppState, socket: WebSocket, remote: SocketAddr) {
    let AppState {
        relay,
        mut shutdown,
    } = state;
    let (mut sink, mut stream) = socket.split();

    let (mut session, mut outbound) = PeerSession::channel(Some(remote));
    relay.attach(&mut session);
    let session_id = session.id();
    debug!("Connection {} opened from {}", session_id, remote);

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                Frame::Text(text) => WsMessage::Text(text),
                Frame::Binary(bytes) => WsMessage::Binary(bytes),
                Frame::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = sink.send(message).await {
                debug!("Write to {} failed: {}", remote, e);
                break;
            }
        }
    });

    let mut writer_done = false;
    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(WsMessage::Text(text))) => session.dispatch(Frame::Text(text)),
                Some(Ok(WsMessage::Binary(bytes))) => session.dispatch(Frame::Binary(bytes)),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Read from {} failed: {}", remote, e);
                    break;
                }
            },
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            _ = stopped(&mut shutdown) => {
                session.handle().close();
                break;
            }
        }
    }

    relay.on_disconnect(session_id);
    drop(session);
    // Let a queued close frame go out before giving up on the writer
    if !writer_done
        && tokio::time::timeout(Duration::from_secs(1), &mut writer)
            .await
            .is_err()
    {
        writer.abort();
    }
    debug!("Connection {} from {} closed", session_id, remote);
}

/// Resolves once the shutdown flag is set; never if its sender is gone
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
