pub mod polling;
pub mod socket;
pub mod stream;

use std::time::Duration;

use runcash_core::config::ClientConfig;
use tracing::warn;

pub use polling::PollingTransport;
pub use socket::SocketTransport;
pub use stream::StreamTransport;

use crate::transport::Transport;

/// The four production transports, wired from config.
pub fn standard_set(cfg: &ClientConfig) -> Vec<Box<dyn Transport>> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(cfg.open_timeout_ms))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "HTTP client build failed, using defaults");
            reqwest::Client::new()
        });

    vec![
        Box::new(StreamTransport::direct(http.clone(), &cfg.stream_url)),
        Box::new(StreamTransport::proxied(
            http.clone(),
            &cfg.proxy_prefix,
            &cfg.stream_url,
        )),
        Box::new(PollingTransport::new(http, cfg)),
        Box::new(SocketTransport::new(cfg)),
    ]
}
