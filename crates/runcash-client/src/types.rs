use std::fmt;
use std::sync::Arc;

use runcash_core::RelayEvent;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// One concrete delivery mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Unidirectional push-stream against the canonical endpoint.
    DirectStream,
    /// The same push-stream tunneled through a public CORS relay.
    ProxiedStream,
    /// Fixed-interval request/response against the recent-events endpoint.
    Polling,
    /// Managed, auto-reconnecting bidirectional socket.
    Socket,
}

impl TransportKind {
    /// Fallback priority, highest preference first.
    pub const PRIORITY: [TransportKind; 4] = [
        TransportKind::DirectStream,
        TransportKind::ProxiedStream,
        TransportKind::Polling,
        TransportKind::Socket,
    ];

    /// The most resilient fallback: tried first at startup and committed to
    /// once the fallback cycles are exhausted.
    pub const MOST_RESILIENT: TransportKind = TransportKind::Socket;

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::DirectStream => "direct-stream",
            TransportKind::ProxiedStream => "proxied-stream",
            TransportKind::Polling => "polling",
            TransportKind::Socket => "socket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned by `subscribe`, used to unsubscribe exactly that callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Listener invoked on the router task for every dispatched event.
pub type Callback = Arc<dyn Fn(&RelayEvent) + Send + Sync>;

/// What a running transport reports back to the router.
#[derive(Debug)]
pub enum Signal {
    Opened,
    Failed(TransportError),
    Event(RelayEvent),
}

/// A signal tagged with the start generation that produced it, so the router
/// can discard anything from a transport it already stopped.
#[derive(Debug)]
pub struct Envelope {
    pub generation: u64,
    pub kind: TransportKind,
    pub signal: Signal,
}

/// Cloneable reporting handle given to a transport on `start`.
#[derive(Debug, Clone)]
pub struct SignalSink {
    generation: u64,
    kind: TransportKind,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl SignalSink {
    pub fn new(generation: u64, kind: TransportKind, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            generation,
            kind,
            tx,
        }
    }

    pub fn opened(&self) {
        self.emit(Signal::Opened);
    }

    pub fn failed(&self, err: TransportError) {
        self.emit(Signal::Failed(err));
    }

    pub fn event(&self, event: RelayEvent) {
        self.emit(Signal::Event(event));
    }

    /// Whether the router is still listening at all.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn emit(&self, signal: Signal) {
        // a closed channel means the router is gone; nothing left to tell
        let _ = self.tx.send(Envelope {
            generation: self.generation,
            kind: self.kind,
            signal,
        });
    }
}
