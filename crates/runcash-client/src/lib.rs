//! Consumer side of the relay: an event router that keeps one transport
//! alive out of an ordered fallback list and hands every normalized event to
//! registered listeners.

pub mod error;
pub mod fallback;
pub mod router;
pub mod transport;
pub mod transports;
pub mod types;

pub use error::TransportError;
pub use fallback::{BackoffPolicy, Directive, FallbackMachine, Phase};
pub use router::EventRouter;
pub use transport::Transport;
pub use types::{Callback, Signal, SignalSink, SubscriptionId, TransportKind};
