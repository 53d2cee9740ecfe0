//! Client Event Router.
//!
//! One background task owns the active transport, the fallback machine and
//! the listener table. Transports and the public handle talk to it over
//! channels, so listener callbacks only ever run on that task, one at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use runcash_core::config::ClientConfig;
use runcash_core::dedup::DedupRing;
use runcash_core::types::WILDCARD_TOPIC;
use runcash_core::RelayEvent;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fallback::{Directive, FallbackMachine};
use crate::transport::Transport;
use crate::transports::standard_set;
use crate::types::{Callback, Envelope, Signal, SignalSink, SubscriptionId, TransportKind};

enum Command {
    Subscribe {
        topic: String,
        id: SubscriptionId,
        callback: Callback,
    },
    Unsubscribe {
        topic: String,
        id: SubscriptionId,
    },
    Stop,
}

/// Handle to a running router. Dropping it stops the router task.
pub struct EventRouter {
    commands: mpsc::UnboundedSender<Command>,
    connected: watch::Receiver<bool>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventRouter {
    /// Start with the four standard transports. Must be called inside a
    /// Tokio runtime.
    pub fn start(cfg: &ClientConfig) -> Self {
        Self::with_transports(cfg, standard_set(cfg))
    }

    /// Start with an explicit transport set. A kind missing from the set
    /// counts as failing immediately whenever its turn comes.
    pub fn with_transports(cfg: &ClientConfig, transports: Vec<Box<dyn Transport>>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(true);

        let state = RouterLoop {
            transports: transports.into_iter().map(|t| (t.kind(), t)).collect(),
            machine: FallbackMachine::new(cfg, Instant::now()),
            listeners: HashMap::new(),
            seen: DedupRing::new(cfg.dedup_capacity),
            generation: 0,
            active: None,
            signal_tx,
            connected: connected_tx,
        };
        let task = tokio::spawn(state.run(cmd_rx, signal_rx));

        Self {
            commands: cmd_tx,
            connected: connected_rx,
            next_id: AtomicU64::new(1),
            task: Mutex::new(Some(task)),
        }
    }

    /// Register `callback` for `topic` (a game name, or `*` for every game).
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.commands.send(Command::Subscribe {
            topic: topic.into(),
            id,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let _ = self.commands.send(Command::Unsubscribe {
            topic: topic.to_string(),
            id,
        });
    }

    /// Live/degraded indicator: false only while every transport's latest
    /// attempt has failed.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch channel over [`is_connected`](Self::is_connected).
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Stop the active transport, cancel pending retries and wait for the
    /// router task to exit.
    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Stop);
    }
}

struct RouterLoop {
    transports: HashMap<TransportKind, Box<dyn Transport>>,
    machine: FallbackMachine,
    listeners: HashMap<String, Vec<(SubscriptionId, Callback)>>,
    seen: DedupRing<String>,
    generation: u64,
    active: Option<TransportKind>,
    signal_tx: mpsc::UnboundedSender<Envelope>,
    connected: watch::Sender<bool>,
}

impl RouterLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Envelope>,
    ) {
        info!("event router started");
        loop {
            let deadline = self.machine.next_deadline();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Stop) | None => break,
                    Some(cmd) => self.apply(cmd),
                },
                Some(envelope) = signals.recv() => self.on_signal(envelope),
                _ = wait_until(deadline) => {
                    if let Some(directive) = self.machine.tick(Instant::now()) {
                        self.execute(directive);
                    }
                }
            }
            self.publish_connectivity();
        }

        self.machine.stop();
        if let Some(kind) = self.active.take() {
            self.stop_transport(kind);
        }
        info!("event router stopped");
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe {
                topic,
                id,
                callback,
            } => {
                let entry = self.listeners.entry(topic.clone()).or_default();
                let first = entry.is_empty();
                entry.push((id, callback));
                debug!(topic = %topic, subscription = %id, "listener added");
                if first {
                    if let Some(t) = self.active_transport() {
                        t.join(&topic);
                    }
                }
            }
            Command::Unsubscribe { topic, id } => {
                let Some(entry) = self.listeners.get_mut(&topic) else {
                    return;
                };
                entry.retain(|(sid, _)| *sid != id);
                if entry.is_empty() {
                    self.listeners.remove(&topic);
                    if let Some(t) = self.active_transport() {
                        t.leave(&topic);
                    }
                }
                debug!(topic = %topic, subscription = %id, "listener removed");
            }
            Command::Stop => {}
        }
    }

    fn execute(&mut self, directive: Directive) {
        match directive {
            Directive::Start(kind) => {
                self.generation += 1;
                let sink = SignalSink::new(self.generation, kind, self.signal_tx.clone());
                let topics: Vec<String> = self.listeners.keys().cloned().collect();
                match self.transports.get_mut(&kind) {
                    Some(t) => {
                        info!(transport = %kind, "activating transport");
                        t.start(sink, &topics);
                        self.active = Some(kind);
                    }
                    None => {
                        warn!(transport = %kind, "transport not configured, skipping");
                        self.machine.on_failed(kind, Instant::now());
                    }
                }
            }
            Directive::Abandon(kind) => {
                self.stop_transport(kind);
                self.active = None;
            }
        }
    }

    fn on_signal(&mut self, envelope: Envelope) {
        if envelope.generation != self.generation {
            debug!(transport = %envelope.kind, "stale transport signal ignored");
            return;
        }
        match envelope.signal {
            Signal::Opened => {
                if self.machine.on_opened(envelope.kind) {
                    info!(transport = %envelope.kind, "transport open");
                }
            }
            Signal::Failed(err) => {
                if self.machine.on_failed(envelope.kind, Instant::now()) {
                    warn!(transport = %envelope.kind, error = %err, "transport failed, rotating");
                    self.stop_transport(envelope.kind);
                    self.active = None;
                }
            }
            Signal::Event(event) => self.dispatch(event),
        }
    }

    /// Topic listeners first, then wildcard listeners; each event identity
    /// at most once.
    fn dispatch(&mut self, event: RelayEvent) {
        if !self.seen.insert(event.identity()) {
            debug!(identity = %event.identity(), "duplicate event suppressed");
            return;
        }
        let topic = event.topic();
        if let Some(listeners) = self.listeners.get(topic) {
            for (_, callback) in listeners {
                callback(&event);
            }
        }
        if topic != WILDCARD_TOPIC {
            if let Some(listeners) = self.listeners.get(WILDCARD_TOPIC) {
                for (_, callback) in listeners {
                    callback(&event);
                }
            }
        }
    }

    fn active_transport(&mut self) -> Option<&mut Box<dyn Transport>> {
        let kind = self.active?;
        self.transports.get_mut(&kind)
    }

    fn stop_transport(&mut self, kind: TransportKind) {
        if let Some(t) = self.transports.get_mut(&kind) {
            t.stop();
        }
    }

    fn publish_connectivity(&self) {
        let now = self.machine.connected();
        let changed = self.connected.send_if_modified(|current| {
            if *current == now {
                return false;
            }
            *current = now;
            true
        });
        if changed {
            info!(connected = now, "connectivity changed");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use chrono::{TimeZone, Utc};
    use runcash_core::OutcomeEvent;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Behavior {
        Open,
        Fail,
        /// Fail on the first start, open afterwards.
        FailOnce,
    }

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeTransport {
        kind: TransportKind,
        behavior: Behavior,
        starts: u32,
        running: bool,
        log: Log,
        sink: Arc<Mutex<Option<SignalSink>>>,
    }

    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn start(&mut self, sink: SignalSink, topics: &[String]) {
            if self.running {
                return;
            }
            self.running = true;
            self.starts += 1;
            self.log.lock().unwrap().push(format!("start:{}", self.kind));
            for t in topics {
                self.log.lock().unwrap().push(format!("join:{t}"));
            }
            let fail = match self.behavior {
                Behavior::Open => false,
                Behavior::Fail => true,
                Behavior::FailOnce => self.starts == 1,
            };
            if fail {
                sink.failed(TransportError::ConnectionFailed("refused".into()));
            } else {
                sink.opened();
            }
            *self.sink.lock().unwrap() = Some(sink);
        }

        fn stop(&mut self) {
            if self.running {
                self.log.lock().unwrap().push(format!("stop:{}", self.kind));
            }
            self.running = false;
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn join(&mut self, topic: &str) {
            self.log.lock().unwrap().push(format!("join:{topic}"));
        }

        fn leave(&mut self, topic: &str) {
            self.log.lock().unwrap().push(format!("leave:{topic}"));
        }
    }

    struct Rig {
        log: Log,
        socket_sink: Arc<Mutex<Option<SignalSink>>>,
        transports: Vec<Box<dyn Transport>>,
    }

    fn rig(behaviors: [(TransportKind, Behavior); 4]) -> Rig {
        let log: Log = Arc::default();
        let socket_sink: Arc<Mutex<Option<SignalSink>>> = Arc::default();
        let transports = behaviors
            .into_iter()
            .map(|(kind, behavior)| {
                let sink = if kind == TransportKind::Socket {
                    Arc::clone(&socket_sink)
                } else {
                    Arc::default()
                };
                Box::new(FakeTransport {
                    kind,
                    behavior,
                    starts: 0,
                    running: false,
                    log: Arc::clone(&log),
                    sink,
                }) as Box<dyn Transport>
            })
            .collect();
        Rig {
            log,
            socket_sink,
            transports,
        }
    }

    fn fast_cfg() -> ClientConfig {
        ClientConfig {
            open_timeout_ms: 200,
            backoff_base_ms: 1,
            backoff_ceiling_ms: 5,
            max_cycles: 1,
            ..ClientConfig::default()
        }
    }

    fn outcome(game: &str, value: u8, secs: i64) -> RelayEvent {
        RelayEvent::Outcome(
            OutcomeEvent::new(game, game, value, Utc.timestamp_opt(secs, 0).unwrap()).unwrap(),
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn starts(log: &Log) -> Vec<String> {
        log.lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("start:"))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn falls_through_to_last_transport() {
        let rig = rig([
            (TransportKind::DirectStream, Behavior::Fail),
            (TransportKind::ProxiedStream, Behavior::Fail),
            (TransportKind::Polling, Behavior::Fail),
            (TransportKind::Socket, Behavior::FailOnce),
        ]);
        let router = EventRouter::with_transports(
            &ClientConfig {
                max_cycles: 3,
                ..fast_cfg()
            },
            rig.transports,
        );

        let log = Arc::clone(&rig.log);
        eventually(|| starts(&log).len() >= 5).await;
        assert_eq!(
            starts(&rig.log),
            vec![
                "start:socket",
                "start:direct-stream",
                "start:proxied-stream",
                "start:polling",
                "start:socket",
            ]
        );
        eventually(|| router.is_connected()).await;
        router.stop().await;
    }

    #[tokio::test]
    async fn dispatches_topic_then_wildcard_once() {
        let rig = rig([
            (TransportKind::DirectStream, Behavior::Fail),
            (TransportKind::ProxiedStream, Behavior::Fail),
            (TransportKind::Polling, Behavior::Fail),
            (TransportKind::Socket, Behavior::Open),
        ]);
        let router = EventRouter::with_transports(&fast_cfg(), rig.transports);

        let seen: Log = Arc::default();
        let s = Arc::clone(&seen);
        router.subscribe("A", move |ev| s.lock().unwrap().push(format!("A:{}", ev.topic())));
        let s = Arc::clone(&seen);
        router.subscribe(WILDCARD_TOPIC, move |ev| {
            s.lock().unwrap().push(format!("*:{}", ev.topic()))
        });

        let sink_slot = Arc::clone(&rig.socket_sink);
        eventually(|| sink_slot.lock().unwrap().is_some()).await;
        let sink = rig.socket_sink.lock().unwrap().clone().unwrap();
        sink.event(outcome("A", 5, 1));
        sink.event(outcome("A", 5, 1));
        sink.event(outcome("B", 7, 2));

        let s = Arc::clone(&seen);
        eventually(|| s.lock().unwrap().len() >= 3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["A:A", "*:A", "*:B"]);
        router.stop().await;
    }

    #[tokio::test]
    async fn subscriptions_drive_topic_membership() {
        let rig = rig([
            (TransportKind::DirectStream, Behavior::Fail),
            (TransportKind::ProxiedStream, Behavior::Fail),
            (TransportKind::Polling, Behavior::Fail),
            (TransportKind::Socket, Behavior::Open),
        ]);
        let router = EventRouter::with_transports(&fast_cfg(), rig.transports);
        let sink_slot = Arc::clone(&rig.socket_sink);
        eventually(|| sink_slot.lock().unwrap().is_some()).await;

        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        let first = router.subscribe("A", move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        let second = router.subscribe("A", |_| {});
        router.unsubscribe("A", first);

        let sink = rig.socket_sink.lock().unwrap().clone().unwrap();
        sink.event(outcome("A", 1, 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        router.unsubscribe("A", second);
        let log = Arc::clone(&rig.log);
        eventually(|| log.lock().unwrap().iter().any(|l| l == "leave:A")).await;
        let joins = rig
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| *l == "join:A")
            .count();
        assert_eq!(joins, 1);
        router.stop().await;
    }

    #[tokio::test]
    async fn all_failing_clears_flag_and_commits_to_socket() {
        let rig = rig([
            (TransportKind::DirectStream, Behavior::Fail),
            (TransportKind::ProxiedStream, Behavior::Fail),
            (TransportKind::Polling, Behavior::Fail),
            (TransportKind::Socket, Behavior::Fail),
        ]);
        let router = EventRouter::with_transports(&fast_cfg(), rig.transports);
        let mut connectivity = router.connectivity();

        let log = Arc::clone(&rig.log);
        eventually(|| starts(&log).len() >= 8).await;
        assert!(!router.is_connected());
        assert!(!*connectivity.borrow_and_update());
        assert!(starts(&rig.log)[4..].iter().all(|s| s == "start:socket"));
        router.stop().await;
    }

    #[tokio::test]
    async fn silent_transport_times_out() {
        struct Silent(TransportKind);
        impl Transport for Silent {
            fn kind(&self) -> TransportKind {
                self.0
            }
            fn start(&mut self, _sink: SignalSink, _topics: &[String]) {}
            fn stop(&mut self) {}
            fn is_running(&self) -> bool {
                false
            }
        }
        let mut rig = rig([
            (TransportKind::DirectStream, Behavior::Open),
            (TransportKind::ProxiedStream, Behavior::Fail),
            (TransportKind::Polling, Behavior::Fail),
            (TransportKind::Socket, Behavior::Open),
        ]);
        rig.transports.retain(|t| t.kind() != TransportKind::Socket);
        rig.transports.push(Box::new(Silent(TransportKind::Socket)));

        let router = EventRouter::with_transports(
            &ClientConfig {
                open_timeout_ms: 50,
                max_cycles: 3,
                ..fast_cfg()
            },
            rig.transports,
        );
        let log = Arc::clone(&rig.log);
        eventually(|| starts(&log).contains(&"start:direct-stream".to_string())).await;
        assert!(router.is_connected());
        router.stop().await;
    }

    #[tokio::test]
    async fn stop_shuts_down_open_transport() {
        let rig = rig([
            (TransportKind::DirectStream, Behavior::Fail),
            (TransportKind::ProxiedStream, Behavior::Fail),
            (TransportKind::Polling, Behavior::Fail),
            (TransportKind::Socket, Behavior::Open),
        ]);
        let router = EventRouter::with_transports(&fast_cfg(), rig.transports);
        let sink_slot = Arc::clone(&rig.socket_sink);
        eventually(|| sink_slot.lock().unwrap().is_some()).await;

        router.stop().await;
        assert_eq!(rig.log.lock().unwrap().last().map(String::as_str), Some("stop:socket"));
    }

    #[tokio::test]
    async fn stop_cancels_pending_retry() {
        let rig = rig([
            (TransportKind::DirectStream, Behavior::Fail),
            (TransportKind::ProxiedStream, Behavior::Fail),
            (TransportKind::Polling, Behavior::Fail),
            (TransportKind::Socket, Behavior::Fail),
        ]);
        let router = EventRouter::with_transports(
            &ClientConfig {
                backoff_base_ms: 100,
                backoff_ceiling_ms: 100,
                max_cycles: 3,
                ..fast_cfg()
            },
            rig.transports,
        );
        let log = Arc::clone(&rig.log);
        eventually(|| !starts(&log).is_empty()).await;

        router.stop().await;
        let before = starts(&rig.log).len();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(starts(&rig.log).len(), before);
    }
}
