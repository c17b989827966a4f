//! Signalling relay pairing wsnet listeners with dialers.
//!
//! A listener's socket carries a yamux session on which the relay is the
//! client. Each dialer socket is piped into a fresh stream on the session
//! of the workspace it names.

pub mod config;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_yamux::{Config as YamuxConfig, Control, Session};
use wsnet::broker::{close_parts, BrokerConn, CloseStatus, FrameChannel, Inbound, Outbound};

#[derive(Clone)]
struct Agent {
    generation: u64,
    control: Control,
}

/// Registered listeners keyed by workspace id.
#[derive(Clone, Default)]
pub struct RelayState {
    agents: Arc<Mutex<HashMap<String, Agent>>>,
    generations: Arc<AtomicU64>,
}

impl RelayState {
    pub fn listener_count(&self) -> usize {
        self.agents.lock().len()
    }

    /// Listener sessions accepted so far, replacements included.
    pub fn registrations(&self) -> u64 {
        self.generations.load(Ordering::Relaxed)
    }

    fn control(&self, workspace: &str) -> Option<Control> {
        self.agents
            .lock()
            .get(workspace)
            .map(|agent| agent.control.clone())
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/listen/:id", get(listen))
        .route("/connect/:id", get(connect))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn listen(
    Path(workspace): Path<String>,
    State(state): State<RelayState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_listener(state, workspace, socket))
}

async fn serve_listener(state: RelayState, workspace: String, socket: WebSocket) {
    // The listener serves streams; we only open them
    let mut session = Session::new_client(websocket_conn(socket), YamuxConfig::default());
    let generation = state.generations.fetch_add(1, Ordering::Relaxed);
    let replaced = state.agents.lock().insert(
        workspace.clone(),
        Agent {
            generation,
            control: session.control(),
        },
    );
    tracing::info!(
        target = "wsnet_broker::relay",
        workspace = %workspace,
        replaced = replaced.is_some(),
        "listener registered"
    );

    while let Some(stream) = session.next().await {
        match stream {
            Ok(_) => tracing::debug!(
                target = "wsnet_broker::relay",
                workspace = %workspace,
                "ignoring stream opened by listener"
            ),
            Err(err) => {
                tracing::debug!(target = "wsnet_broker::relay", workspace = %workspace, error = %err, "listener session failed");
                break;
            }
        }
    }

    // Only forget the workspace if no newer listener took it over
    let mut agents = state.agents.lock();
    if agents
        .get(&workspace)
        .is_some_and(|agent| agent.generation == generation)
    {
        agents.remove(&workspace);
    }
    tracing::info!(target = "wsnet_broker::relay", workspace = %workspace, "listener gone");
}

async fn connect(
    Path(workspace): Path<String>,
    State(state): State<RelayState>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(mut control) = state.control(&workspace) else {
        return (StatusCode::NOT_FOUND, "no listener for workspace").into_response();
    };
    ws.on_upgrade(move |socket| async move {
        let mut dialer = websocket_conn(socket);
        let mut stream = match control.open_stream().await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(target = "wsnet_broker::relay", workspace = %workspace, error = %err, "open listener stream");
                dialer
                    .closer()
                    .close(CloseStatus::Abnormal("listener unavailable".into()));
                return;
            }
        };
        // Pipe the handshake until either side finishes
        match tokio::io::copy_bidirectional(&mut dialer, &mut stream).await {
            Ok((up, down)) => tracing::debug!(
                target = "wsnet_broker::relay",
                workspace = %workspace,
                up,
                down,
                "handshake relayed"
            ),
            Err(err) => tracing::debug!(
                target = "wsnet_broker::relay",
                workspace = %workspace,
                error = %err,
                "handshake relay ended"
            ),
        }
    })
}

/// Adapts an axum socket to the byte stream used by wsnet.
pub fn websocket_conn(socket: WebSocket) -> BrokerConn {
    let (conn, frames) = BrokerConn::pair();
    tokio::spawn(pump(socket, frames));
    conn
}

fn inbound_status(frame: Option<CloseFrame<'_>>) -> CloseStatus {
    match frame {
        None => CloseStatus::Normal,
        Some(frame) if frame.code == 1000 || frame.code == 1001 => CloseStatus::Normal,
        Some(frame) => CloseStatus::Abnormal(format!("{}: {}", frame.code, frame.reason)),
    }
}

async fn pump(socket: WebSocket, frames: FrameChannel) {
    let FrameChannel { tx_in, mut rx_out } = frames;
    let (mut ws_write, mut ws_read) = socket.split();
    let mut sent_close = false;

    loop {
        tokio::select! {
            outbound = rx_out.recv(), if !sent_close => {
                let status = match outbound {
                    Some(Outbound::Data(data)) => {
                        if ws_write.send(Message::Binary(data.to_vec())).await.is_err() {
                            let _ = tx_in.send(Inbound::Closed(CloseStatus::Abnormal("write failed".into())));
                            break;
                        }
                        continue;
                    }
                    Some(Outbound::Close(status)) => status,
                    None => CloseStatus::Abnormal("connection dropped".into()),
                };
                let (code, reason) = close_parts(&status);
                sent_close = true;
                if ws_write
                    .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            inbound = ws_read.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    let _ = tx_in.send(Inbound::Data(data.into()));
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = tx_in.send(Inbound::Data(text.into_bytes().into()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let _ = tx_in.send(Inbound::Closed(inbound_status(frame)));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = tx_in.send(Inbound::Closed(CloseStatus::Abnormal(err.to_string())));
                    break;
                }
                None => {
                    let _ = tx_in.send(Inbound::Closed(CloseStatus::Abnormal(
                        "socket ended without a close frame".into(),
                    )));
                    break;
                }
            }
        }
    }
    let _ = ws_write.close().await;
}
