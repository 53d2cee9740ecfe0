use std::time::Duration;

use runcash_core::config::ClientConfig;
use runcash_core::RelayEvent;
use runcash_protocol::decode::decode_poll_body;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::Transport;
use crate::types::{SignalSink, TransportKind};

/// Fixed-interval polling of the recent-events endpoint.
///
/// The endpoint returns an overlapping window each time; the router's
/// identity ring drops the repeats.
pub struct PollingTransport {
    url: String,
    http: reqwest::Client,
    interval: Duration,
    max_errors: u32,
    cancel: Option<CancellationToken>,
}

impl PollingTransport {
    pub fn new(http: reqwest::Client, cfg: &ClientConfig) -> Self {
        Self {
            url: cfg.poll_url.clone(),
            http,
            interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            max_errors: cfg.max_poll_errors.max(1),
            cancel: None,
        }
    }
}

impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn start(&mut self, sink: SignalSink, _topics: &[String]) {
        if self.cancel.is_some() {
            debug!("polling already started");
            return;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let http = self.http.clone();
        let url = self.url.clone();
        let (interval, max_errors) = (self.interval, self.max_errors);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => debug!("polling cancelled"),
                err = poll_loop(&http, &url, interval, max_errors, &sink) => sink.failed(err),
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

async fn poll_loop(
    http: &reqwest::Client,
    url: &str,
    every: Duration,
    max_errors: u32,
    sink: &SignalSink,
) -> TransportError {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut opened = false;
    let mut errors = 0u32;

    loop {
        tick.tick().await;
        match fetch(http, url).await {
            Ok(events) => {
                errors = 0;
                if !opened {
                    opened = true;
                    sink.opened();
                }
                // newest first on the wire; deliver in chronological order
                for event in events.into_iter().rev() {
                    sink.event(event);
                }
            }
            Err(e) => {
                errors += 1;
                warn!(url, error = %e, errors, max_errors, "poll failed");
                if errors >= max_errors {
                    return TransportError::PollFailures { count: errors };
                }
            }
        }
    }
}

async fn fetch(http: &reqwest::Client, url: &str) -> Result<Vec<RelayEvent>, TransportError> {
    let body = http.get(url).send().await?.error_for_status()?.text().await?;
    Ok(decode_poll_body(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Envelope, Signal};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cfg = ClientConfig {
            poll_url: format!("http://{addr}/api/latest-numbers"),
            poll_interval_ms: 10,
            max_poll_errors: 2,
            ..ClientConfig::default()
        };
        let mut transport = PollingTransport::new(reqwest::Client::new(), &cfg);
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let sink = SignalSink::new(1, TransportKind::Polling, tx);
        transport.start(sink.clone(), &[]);
        transport.start(sink, &[]);
        assert!(transport.is_running());

        let env = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            env.signal,
            Signal::Failed(TransportError::PollFailures { count: 2 })
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        transport.stop();
        assert!(!transport.is_running());
    }
}
