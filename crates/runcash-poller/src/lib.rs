//! `runcash-poller`: the producer side of the relay.
//!
//! # Overview
//!
//! [`engine::PollerEngine`] reads the backing store on two fixed intervals:
//!
//! | Tick       | Reads                                   | Emits                          |
//! |------------|-----------------------------------------|--------------------------------|
//! | Outcomes   | newest K outcome rows across all games  | one `new_number` per unseen id |
//! | Strategies | per-game rows + strategy history        | `strategy_update` when newer   |
//!
//! Both ticks run on the same task, so they never overlap. Store failures are
//! logged and retried on the next tick; the connection is re-opened lazily.

pub mod engine;
pub mod error;
pub mod merge;

pub use engine::{PollerEngine, Publisher};
pub use error::{PollerError, Result};
