use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use runcash_protocol::decode::decode_stream_data;
use runcash_protocol::sse::SseDecoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::Transport;
use crate::types::{SignalSink, TransportKind};

/// Push-stream (SSE) reader, either direct or through a CORS relay.
pub struct StreamTransport {
    kind: TransportKind,
    url: String,
    http: reqwest::Client,
    cancel: Option<CancellationToken>,
}

impl StreamTransport {
    pub fn direct(http: reqwest::Client, url: &str) -> Self {
        Self {
            kind: TransportKind::DirectStream,
            url: url.to_string(),
            http,
            cancel: None,
        }
    }

    pub fn proxied(http: reqwest::Client, proxy_prefix: &str, url: &str) -> Self {
        Self {
            kind: TransportKind::ProxiedStream,
            url: proxied_url(proxy_prefix, url),
            http,
            cancel: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// `prefix` followed by the percent-encoded target URL.
pub fn proxied_url(prefix: &str, target: &str) -> String {
    format!("{prefix}{}", urlencoding::encode(target))
}

impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn start(&mut self, sink: SignalSink, _topics: &[String]) {
        if self.cancel.is_some() {
            debug!(transport = %self.kind, "already started");
            return;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let http = self.http.clone();
        let url = self.url.clone();
        let kind = self.kind;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!(transport = %kind, "stream cancelled");
                }
                err = read_stream(&http, &url, &sink) => {
                    sink.failed(err);
                }
            }
        });
        self.cancel = Some(token);
    }

    fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    fn is_running(&self) -> bool {
        self.cancel.is_some()
    }
}

/// Read until the stream ends or errors. Always returns the reason it stopped.
async fn read_stream(http: &reqwest::Client, url: &str, sink: &SignalSink) -> TransportError {
    let resp = match http.get(url).header(ACCEPT, "text/event-stream").send().await {
        Ok(r) => r,
        Err(e) => return e.into(),
    };
    if !resp.status().is_success() {
        return TransportError::Status(resp.status().as_u16());
    }
    info!(url, "push-stream open");
    sink.opened();

    let mut decoder = SseDecoder::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut body = resp.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => return TransportError::Closed(e.to_string()),
        };
        pending.extend_from_slice(&chunk);
        let text = take_utf8(&mut pending);

        for msg in decoder.push(&text) {
            if msg.is_error() {
                return TransportError::ErrorFrame(msg.data);
            }
            match decode_stream_data(&msg.data) {
                Ok(Some(event)) => sink.event(event),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "malformed push-stream event dropped"),
            }
        }
    }
    TransportError::Closed("push-stream ended".into())
}

/// Drain the longest valid UTF-8 prefix; an incomplete trailing sequence
/// stays buffered for the next chunk.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => buf.len(),
    };
    let rest = buf.split_off(valid);
    let text = String::from_utf8_lossy(buf).into_owned();
    *buf = rest;
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Envelope, Signal};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn proxied_url_encodes_target() {
        assert_eq!(
            proxied_url(
                "https://api.allorigins.win/raw?url=",
                "http://relay.example/api/events?gameName=Speed Auto"
            ),
            "https://api.allorigins.win/raw?url=http%3A%2F%2Frelay.example%2Fapi%2Fevents%3FgameName%3DSpeed%20Auto"
        );
    }

    #[test]
    fn split_multibyte_sequence_is_kept_for_next_chunk() {
        let bytes = "data: é\n".as_bytes();
        let mut buf = bytes[..7].to_vec();
        assert_eq!(take_utf8(&mut buf), "data: ");
        assert_eq!(buf.len(), 1);
        buf.extend_from_slice(&bytes[7..]);
        assert_eq!(take_utf8(&mut buf), "é\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn kinds_follow_constructor() {
        let http = reqwest::Client::new();
        assert_eq!(
            StreamTransport::direct(http.clone(), "http://x/").kind(),
            TransportKind::DirectStream
        );
        let proxied = StreamTransport::proxied(http, "https://p/?u=", "http://x/");
        assert_eq!(proxied.kind(), TransportKind::ProxiedStream);
        assert_eq!(proxied.url(), "https://p/?u=http%3A%2F%2Fx%2F");
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport =
            StreamTransport::direct(reqwest::Client::new(), &format!("http://{addr}/api/events"));
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let sink = SignalSink::new(1, TransportKind::DirectStream, tx);
        transport.start(sink.clone(), &[]);
        transport.start(sink, &[]);
        assert!(transport.is_running());

        let env = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(env.signal, Signal::Failed(_)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        transport.stop();
        assert!(!transport.is_running());
    }
}
