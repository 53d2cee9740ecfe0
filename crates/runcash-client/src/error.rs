use thiserror::Error;

/// Why a transport strategy gave up. Never surfaced to subscriber callbacks;
/// the router only logs it and rotates.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint could not be reached or refused the request.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The server answered with a non-success HTTP status.
    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    /// The peer sent an explicit error frame.
    #[error("Error frame received: {0}")]
    ErrorFrame(String),

    /// No successful open within the configured window.
    #[error("Open timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// An established stream or socket ended.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Too many consecutive failed polls.
    #[error("{count} consecutive poll failures")]
    PollFailures { count: u32 },

    /// A payload that should have carried events could not be decoded.
    #[error("Undecodable payload: {0}")]
    Decode(#[from] runcash_protocol::DecodeError),

    /// Reconnect budget of the managed socket exhausted.
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => TransportError::Status(status.as_u16()),
            None => TransportError::ConnectionFailed(e.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::ConnectionFailed(e.to_string())
    }
}
