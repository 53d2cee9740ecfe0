use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use runcash_core::config::ClientConfig;
use runcash_protocol::control::ControlFrame;
use runcash_protocol::decode::decode_socket_frame;
use runcash_protocol::frames::ERROR;
use runcash_protocol::DecodeError;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::Transport;
use crate::types::{SignalSink, TransportKind};

#[derive(Debug)]
enum TopicCmd {
    Join(String),
    Leave(String),
}

#[derive(Debug, Clone)]
struct SocketParams {
    url: String,
    open_timeout: Duration,
    reconnect_attempts: u32,
    retry_base: Duration,
    retry_ceiling: Duration,
}

/// Managed, auto-reconnecting WebSocket to the relay.
///
/// Server-side topic membership follows the router's listeners: a `join`
/// frame per topic on every (re)connect, and live join/leave frames as
/// listeners come and go. An initial connect failure is reported at once;
/// after a drop the transport reconnects on its own and reports failure only
/// once its reconnect budget is spent.
pub struct SocketTransport {
    params: SocketParams,
    cancel: Option<CancellationToken>,
    topics_tx: Option<mpsc::UnboundedSender<TopicCmd>>,
}

impl SocketTransport {
    pub fn new(cfg: &ClientConfig) -> Self {
        Self {
            params: SocketParams {
                url: cfg.socket_url.clone(),
                open_timeout: Duration::from_millis(cfg.open_timeout_ms),
                reconnect_attempts: cfg.socket_reconnect_attempts,
                retry_base: Duration::from_millis(cfg.backoff_base_ms),
                retry_ceiling: Duration::from_millis(cfg.backoff_ceiling_ms),
            },
            cancel: None,
            topics_tx: None,
        }
    }

    fn command(&self, cmd: TopicCmd) {
        if let Some(tx) = &self.topics_tx {
            let _ = tx.send(cmd);
        }
    }
}

impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn start(&mut self, sink: SignalSink, topics: &[String]) {
        if self.cancel.is_some() {
            debug!("socket already started");
            return;
        }
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let topics: BTreeSet<String> = topics.iter().cloned().collect();

        tokio::spawn(run_socket(self.params.clone(), topics, rx, sink, token.clone()));
        self.cancel = Some(token);
        self.topics_tx = Some(tx);
    }

    fn stop(&mut self) {
        self.topics_tx = None;
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    fn join(&mut self, topic: &str) {
        self.command(TopicCmd::Join(topic.to_string()));
    }

    fn leave(&mut self, topic: &str) {
        self.command(TopicCmd::Leave(topic.to_string()));
    }
}

/// How one connected session ended.
enum SessionEnd {
    /// Never got a socket.
    Unreachable(TransportError),
    /// Was open, then dropped; worth reconnecting.
    Dropped(TransportError),
    /// The peer told us to stop.
    Fatal(TransportError),
}

async fn run_socket(
    params: SocketParams,
    mut topics: BTreeSet<String>,
    mut commands: mpsc::UnboundedReceiver<TopicCmd>,
    sink: SignalSink,
    cancel: CancellationToken,
) {
    let mut ever_opened = false;
    let mut attempt = 0u32;

    loop {
        let end = tokio::select! {
            _ = cancel.cancelled() => return,
            end = session(&params, &mut topics, &mut commands, &sink) => end,
        };

        let err = match end {
            SessionEnd::Fatal(e) => {
                sink.failed(e);
                return;
            }
            SessionEnd::Unreachable(e) if !ever_opened => {
                sink.failed(e);
                return;
            }
            SessionEnd::Unreachable(e) => e,
            SessionEnd::Dropped(e) => {
                ever_opened = true;
                attempt = 0;
                e
            }
        };

        attempt += 1;
        if attempt > params.reconnect_attempts {
            sink.failed(TransportError::ReconnectExhausted {
                attempts: params.reconnect_attempts,
            });
            return;
        }
        let delay = (params.retry_base * attempt).min(params.retry_ceiling);
        warn!(
            error = %err,
            attempt,
            max = params.reconnect_attempts,
            retry_after_ms = delay.as_millis() as u64,
            "socket lost, reconnecting"
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn session(
    params: &SocketParams,
    topics: &mut BTreeSet<String>,
    commands: &mut mpsc::UnboundedReceiver<TopicCmd>,
    sink: &SignalSink,
) -> SessionEnd {
    let connect = tokio_tungstenite::connect_async(params.url.as_str());
    let ws = match tokio::time::timeout(params.open_timeout, connect).await {
        Ok(Ok((ws, _resp))) => ws,
        Ok(Err(e)) => return SessionEnd::Unreachable(e.into()),
        Err(_) => {
            return SessionEnd::Unreachable(TransportError::Timeout {
                ms: params.open_timeout.as_millis() as u64,
            })
        }
    };
    info!(url = %params.url, topics = topics.len(), "socket open");
    sink.opened();

    let (mut write, mut read) = ws.split();
    for topic in topics.iter() {
        let frame = ControlFrame::join(topic.clone()).to_json();
        if let Err(e) = write.send(Message::Text(frame)).await {
            return SessionEnd::Dropped(e.into());
        }
    }

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = handle_text(&text, sink) {
                        return SessionEnd::Fatal(e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return SessionEnd::Dropped(TransportError::Closed(reason));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Dropped(e.into()),
                None => return SessionEnd::Dropped(TransportError::Closed("socket ended".into())),
            },

            cmd = commands.recv() => {
                let frame = match cmd {
                    Some(TopicCmd::Join(topic)) => {
                        topics.insert(topic.clone()).then(|| ControlFrame::join(topic))
                    }
                    Some(TopicCmd::Leave(topic)) => {
                        topics.remove(&topic).then(|| ControlFrame::leave(topic))
                    }
                    None => {
                        return SessionEnd::Dropped(TransportError::Closed(
                            "transport dropped".into(),
                        ))
                    }
                };
                if let Some(frame) = frame {
                    if let Err(e) = write.send(Message::Text(frame.to_json())).await {
                        return SessionEnd::Dropped(e.into());
                    }
                }
            }
        }
    }
}

/// Forward every event in one text frame. Only an explicit error frame is
/// fatal; anything else malformed is logged and dropped.
fn handle_text(text: &str, sink: &SignalSink) -> Result<(), TransportError> {
    match decode_socket_frame(text) {
        Ok(events) => {
            for event in events {
                sink.event(event);
            }
            Ok(())
        }
        Err(DecodeError::UnknownType(kind)) if kind == ERROR => {
            Err(TransportError::ErrorFrame(text.to_string()))
        }
        Err(e) => {
            warn!(error = %e, "malformed socket frame dropped");
            Ok(())
        }
    }
}
