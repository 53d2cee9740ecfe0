use runcash_store::StoreError;
use thiserror::Error;

/// Errors surfaced by a single poll tick. None of them stop the loop.
#[derive(Debug, Error)]
pub enum PollerError {
    /// Backing-store read failed; retried on the next tick.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, PollerError>;
