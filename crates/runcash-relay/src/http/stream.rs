//! Push-stream endpoint: GET /api/events.
//!
//! Each stream is a broadcaster connection like a socket. Wire order:
//! a `retry:` hint, a replay of the newest global events (oldest first),
//! then live events with a `ping` data frame every heartbeat interval.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
};
use futures_util::Stream;
use runcash_core::config::STREAM_RETRY_HINT_MS;
use runcash_core::types::{ConnId, WILDCARD_TOPIC};
use runcash_protocol::frames::ServerFrame;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::app::AppState;
use crate::ws::broadcast::Broadcaster;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    /// Restrict the stream to one game; omitted means every game.
    pub game_name: Option<String>,
}

/// Removes the stream's connection from every topic when the client goes away.
struct StreamGuard {
    broadcaster: Arc<Broadcaster>,
    conn_id: ConnId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.broadcaster.disconnect(&self.conn_id);
        debug!(conn_id = %self.conn_id, "push-stream closed");
    }
}

pub async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let conn_id = ConnId::new();
    let topic = q
        .game_name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| WILDCARD_TOPIC.to_string());

    let (tx, mut rx) = mpsc::channel::<String>(state.config.server.send_queue);
    let broadcaster = Arc::clone(&state.broadcaster);

    // Subscribed before the replay snapshot: an event published in between
    // may arrive twice, never zero times.
    broadcaster.register(conn_id.clone(), tx);
    broadcaster.subscribe(&conn_id, &topic);
    info!(conn_id = %conn_id, topic = %topic, "push-stream opened");

    let mut replay: Vec<String> = broadcaster
        .recent_events(state.config.server.recent_window)
        .into_iter()
        .filter(|ev| topic == WILDCARD_TOPIC || ev.topic() == topic)
        .take(state.config.server.stream_replay)
        .map(|ev| ServerFrame::from(ev).to_json())
        .collect();
    replay.reverse();

    let guard = StreamGuard {
        broadcaster,
        conn_id,
    };
    let heartbeat = Duration::from_secs(state.config.server.heartbeat_secs.max(1));

    let stream = async_stream::stream! {
        let _guard = guard;

        yield Ok(Event::default().retry(Duration::from_millis(STREAM_RETRY_HINT_MS)));
        for data in replay {
            yield Ok(Event::default().data(data));
        }

        let mut tick = tokio::time::interval(heartbeat);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;

        loop {
            let next = tokio::select! {
                msg = rx.recv() => msg,
                _ = tick.tick() => Some(ServerFrame::ping().to_json()),
            };
            match next {
                Some(data) => yield Ok(Event::default().data(data)),
                None => break,
            }
        }
    };

    Sse::new(stream)
}
