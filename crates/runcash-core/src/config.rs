use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_FRAME_BYTES: usize = 128 * 1024; // 128 KB hard cap per inbound frame
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const STREAM_RETRY_HINT_MS: u64 = 10_000;

/// Relay process config (runcash.toml + RUNCASH_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Records replayed to a connection when it joins a topic.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Global events replayed to a new push-stream before live delivery.
    #[serde(default = "default_stream_replay")]
    pub stream_replay: usize,
    /// Size of the in-memory recent window kept per topic and globally.
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    /// Outbound queue depth per connection; a full queue drops the frame.
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            max_frame_bytes: MAX_FRAME_BYTES,
            heartbeat_secs: HEARTBEAT_INTERVAL_SECS,
            history_limit: default_history_limit(),
            stream_replay: default_stream_replay(),
            recent_window: default_recent_window(),
            send_queue: default_send_queue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// K newest outcome records read per poll tick.
    #[serde(default = "default_outcome_limit")]
    pub outcome_limit: usize,
    /// Newest annotation rows read per strategy tick.
    #[serde(default = "default_strategy_limit")]
    pub strategy_limit: usize,
    #[serde(default = "default_interval_ms")]
    pub outcome_interval_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub strategy_interval_ms: u64,
    /// Ceiling of the dedup marker set. Must be at least `outcome_limit`.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            outcome_limit: default_outcome_limit(),
            strategy_limit: default_strategy_limit(),
            outcome_interval_ms: default_interval_ms(),
            strategy_interval_ms: default_interval_ms(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

/// Direct event push from an upstream producer (`POST /emit-event`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auth: IngestAuthMode,
    /// Shared secret: the bearer token or the HMAC key, depending on `auth`.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IngestAuthMode {
    /// HMAC-SHA256 over the raw body (`X-Hub-Signature-256: sha256=<hex>`).
    HmacSha256,
    /// Static bearer token in the Authorization header.
    BearerToken,
    /// No authentication; trusted networks only.
    #[default]
    None,
}

/// Consumer-side endpoints and fallback timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    /// Public CORS relay; the encoded stream URL is appended to it.
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,
    #[serde(default = "default_poll_url")]
    pub poll_url: String,
    #[serde(default = "default_socket_url")]
    pub socket_url: String,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive polling errors tolerated before the strategy reports failure.
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_max_exponent")]
    pub backoff_max_exponent: u32,
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
    /// Full passes through the fallback list before committing to the socket.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    #[serde(default = "default_socket_reconnects")]
    pub socket_reconnect_attempts: u32,
    #[serde(default = "default_client_dedup")]
    pub dedup_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream_url: default_stream_url(),
            proxy_prefix: default_proxy_prefix(),
            poll_url: default_poll_url(),
            socket_url: default_socket_url(),
            open_timeout_ms: default_open_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_errors: default_max_poll_errors(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_max_exponent: default_backoff_max_exponent(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            max_cycles: default_max_cycles(),
            socket_reconnect_attempts: default_socket_reconnects(),
            dedup_capacity: default_client_dedup(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClientFile {
    #[serde(default)]
    client: ClientConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_max_frame_bytes() -> usize {
    MAX_FRAME_BYTES
}
fn default_heartbeat_secs() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}
fn default_history_limit() -> usize {
    20
}
fn default_stream_replay() -> usize {
    10
}
fn default_recent_window() -> usize {
    20
}
fn default_send_queue() -> usize {
    256
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.runcash/outcomes.db", home)
}
fn default_outcome_limit() -> usize {
    20
}
fn default_strategy_limit() -> usize {
    10
}
fn default_interval_ms() -> u64 {
    2_000
}
fn default_dedup_capacity() -> usize {
    100
}
fn default_stream_url() -> String {
    format!("http://{DEFAULT_BIND}:{DEFAULT_PORT}/api/events")
}
fn default_proxy_prefix() -> String {
    "https://api.allorigins.win/raw?url=".to_string()
}
fn default_poll_url() -> String {
    format!("http://{DEFAULT_BIND}:{DEFAULT_PORT}/api/latest-numbers")
}
fn default_socket_url() -> String {
    format!("ws://{DEFAULT_BIND}:{DEFAULT_PORT}/ws")
}
fn default_open_timeout_ms() -> u64 {
    3_000
}
fn default_poll_interval_ms() -> u64 {
    3_000
}
fn default_max_poll_errors() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_factor() -> f64 {
    1.5
}
fn default_backoff_max_exponent() -> u32 {
    8
}
fn default_backoff_ceiling_ms() -> u64 {
    10_000
}
fn default_max_cycles() -> u32 {
    2
}
fn default_socket_reconnects() -> u32 {
    10
}
fn default_client_dedup() -> usize {
    256
}

impl RelayConfig {
    /// Load config from a TOML file with RUNCASH_* env var overrides.
    ///
    /// Nested keys use a double underscore: `RUNCASH_STORE__PATH=/data/o.db`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `RUNCASH_CONFIG`
    ///   3. ~/.runcash/runcash.toml
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = resolve_path(config_path);

        let config: RelayConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RUNCASH_").split("__"))
            .extract()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.dedup_capacity < self.store.outcome_limit {
            return Err(RelayError::Config(format!(
                "store.dedup_capacity ({}) must be >= store.outcome_limit ({})",
                self.store.dedup_capacity, self.store.outcome_limit
            )));
        }
        if self.store.outcome_interval_ms == 0 || self.store.strategy_interval_ms == 0 {
            return Err(RelayError::Config("poll intervals must be non-zero".into()));
        }
        if self.ingest.enabled
            && self.ingest.auth != IngestAuthMode::None
            && self.ingest.secret.as_deref().unwrap_or("").is_empty()
        {
            return Err(RelayError::Config(
                "ingest.secret is required when ingest.auth is not 'none'".into(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

impl ClientConfig {
    /// Load the `[client]` section of the same file layout, overridable with
    /// `RUNCASH_CLIENT__*` env vars.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = resolve_path(config_path);

        let file: ClientFile = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RUNCASH_").split("__"))
            .extract()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        Ok(file.client)
    }
}

fn resolve_path(config_path: Option<&str>) -> String {
    config_path
        .map(String::from)
        .or_else(|| std::env::var("RUNCASH_CONFIG").ok())
        .unwrap_or_else(default_config_path)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.runcash/runcash.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = RelayConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.store.outcome_limit, 20);
        assert_eq!(cfg.store.dedup_capacity, 100);
    }

    #[test]
    fn dedup_smaller_than_fetch_window_is_rejected() {
        let mut cfg = RelayConfig::default();
        cfg.store.dedup_capacity = 5;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn ingest_auth_needs_secret() {
        let mut cfg = RelayConfig::default();
        cfg.ingest.enabled = true;
        cfg.ingest.auth = IngestAuthMode::BearerToken;
        assert!(cfg.validate().is_err());
        cfg.ingest.secret = Some("s3cret".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nport = 6100\n\n[store]\npath = \"/tmp/x.db\"\noutcome_limit = 30\n\n[client]\nopen_timeout_ms = 500"
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let relay = RelayConfig::load(Some(path)).unwrap();
        assert_eq!(relay.server.port, 6100);
        assert_eq!(relay.server.bind, DEFAULT_BIND);
        assert_eq!(relay.store.outcome_limit, 30);
        assert_eq!(relay.store.strategy_limit, 10);

        let client = ClientConfig::load(Some(path)).unwrap();
        assert_eq!(client.open_timeout_ms, 500);
        assert_eq!(client.poll_interval_ms, 3_000);
    }
}
