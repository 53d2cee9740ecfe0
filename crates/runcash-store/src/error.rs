use runcash_core::RelayError;
use thiserror::Error;

/// Errors raised at the backing-store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No usable connection; the next call will try to reconnect.
    #[error("store disconnected: {0}")]
    Disconnected(String),

    /// A row could not be interpreted.
    #[error("malformed row: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Whether the held connection should be dropped and re-opened.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Disconnected(_))
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Malformed(m) => RelayError::Malformed(m),
            other => RelayError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
