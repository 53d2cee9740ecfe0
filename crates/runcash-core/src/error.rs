use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Short error code string returned to HTTP and socket clients.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "CONFIG_ERROR",
            RelayError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            RelayError::Malformed(_) => "MALFORMED",
            RelayError::Protocol(_) => "PROTOCOL_ERROR",
            RelayError::AuthFailed(_) => "AUTH_FAILED",
            RelayError::Serialization(_) => "SERIALIZATION_ERROR",
            RelayError::Io(_) => "IO_ERROR",
            RelayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            RelayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
