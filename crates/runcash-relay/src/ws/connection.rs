use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use runcash_core::types::ConnId;
use runcash_protocol::control::ControlFrame;
use runcash_protocol::frames::ServerFrame;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::AppState;

/// Axum handler: upgrades HTTP to WebSocket at GET /ws.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let max = state.config.server.max_frame_bytes;
    ws.max_message_size(max)
        .on_upgrade(|socket| run_connection(socket, state))
}

/// Per-connection event loop: lives for the entire WS session.
///
/// The connection is registered with the broadcaster up front but belongs to
/// no topic until the viewer sends `join`.
async fn run_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = ConnId::new();
    info!(conn_id = %conn_id, "new WS connection");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(state.config.server.send_queue);
    state.broadcaster.register(conn_id.clone(), out_tx);

    let status = ServerFrame::ConnectionStatus {
        connected: true,
        store_connected: state.store.is_connected(),
    };
    if sink.send(Message::Text(status.to_json().into())).await.is_err() {
        state.broadcaster.disconnect(&conn_id);
        return;
    }

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(state.config.server.heartbeat_secs.max(1)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.as_str();
                        if text.len() > state.config.server.max_frame_bytes {
                            warn!(conn_id = %conn_id, size = text.len(), "payload too large");
                            break;
                        }
                        handle_control(&state, &conn_id, text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn_id = %conn_id, error = %e, "WS read error");
                        break;
                    }
                    _ => {}
                }
            }

            outbound = out_rx.recv() => {
                let Some(payload) = outbound else { break };
                if sink.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if sink.send(Message::Text(ServerFrame::ping().to_json().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.broadcaster.disconnect(&conn_id);
    info!(conn_id = %conn_id, "WS connection closed");
}

/// Apply one inbound control frame. Malformed frames are logged and dropped;
/// the connection stays open.
fn handle_control(state: &AppState, conn_id: &ConnId, text: &str) {
    match serde_json::from_str::<ControlFrame>(text) {
        Ok(ControlFrame::Join { game_name }) if !game_name.is_empty() => {
            state.broadcaster.join(conn_id, &game_name);
        }
        Ok(ControlFrame::Leave { game_name }) => {
            state.broadcaster.leave(conn_id, &game_name);
        }
        Ok(ControlFrame::Ping) => {}
        Ok(ControlFrame::Join { .. }) => {
            warn!(conn_id = %conn_id, "join without gameName ignored");
        }
        Err(e) => {
            warn!(conn_id = %conn_id, error = %e, "malformed control frame dropped");
        }
    }
}
