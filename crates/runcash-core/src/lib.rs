//! Shared vocabulary of the outcome relay: canonical events, classification,
//! the bounded dedup ring, configuration and the error taxonomy.

pub mod config;
pub mod dedup;
pub mod error;
pub mod types;

pub use error::{RelayError, Result};
pub use types::{Category, OutcomeEvent, RelayEvent, StrategyState, StrategyStateEvent};
