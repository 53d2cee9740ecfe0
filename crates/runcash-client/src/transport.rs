use crate::types::{SignalSink, TransportKind};

/// Common interface implemented by every transport strategy (push-stream,
/// proxied push-stream, polling, managed socket).
///
/// Implementations run their I/O on background tasks and report through the
/// [`SignalSink`] handed to `start`: `opened` once the first successful
/// exchange completes, `event` for every normalized inbound event, `failed`
/// on a connection error or an explicit error frame. The open timeout is
/// enforced by the router, not here.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Begin delivering. `topics` are the topics the router currently has
    /// listeners for. Calling `start` on a running transport is a no-op.
    fn start(&mut self, sink: SignalSink, topics: &[String]);

    /// Tear down the background work. Safe to call when not running.
    fn stop(&mut self);

    /// Whether `start` has been called without a matching `stop`.
    fn is_running(&self) -> bool;

    /// A listener for `topic` appeared. Only transports with server-side
    /// topic membership need to act on it.
    fn join(&mut self, _topic: &str) {}

    /// The last listener for `topic` went away.
    fn leave(&mut self, _topic: &str) {}
}
