use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use runcash_core::types::WILDCARD_TOPIC;
use runcash_core::types::ConnId;
use runcash_core::{OutcomeEvent, RelayEvent, StrategyStateEvent};
use runcash_poller::Publisher;
use runcash_protocol::frames::ServerFrame;
use runcash_store::SharedStore;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Topic registry and fan-out core.
///
/// Each connection registers one outbound queue; topics map a game name (or
/// `*`) to the set of connections that joined it. `publish` serializes the
/// event once and pushes it with `try_send`, so a slow viewer never stalls
/// the poller. Both maps are sharded-lock `DashMap`s. `publish` holds the
/// topic's shard read lock while queueing, so once `leave` or `disconnect`
/// returns the connection receives nothing more from that topic.
pub struct Broadcaster {
    connections: DashMap<ConnId, mpsc::Sender<String>>,
    topics: DashMap<String, HashSet<ConnId>>,
    /// Newest relayed events across all topics, oldest at the front.
    recent: Mutex<VecDeque<RelayEvent>>,
    /// Newest outcomes per topic, oldest at the front.
    recent_by_topic: DashMap<String, VecDeque<OutcomeEvent>>,
    /// Current annotation per `game_id`.
    strategies: DashMap<String, StrategyStateEvent>,
    /// Game name to `game_id`, for topic-keyed lookups.
    strategy_ids: DashMap<String, String>,
    store: Option<Arc<dyn SharedStore>>,
    window: usize,
    history_limit: usize,
    published: AtomicU64,
}

impl Broadcaster {
    pub fn new(window: usize, history_limit: usize) -> Self {
        Self {
            connections: DashMap::new(),
            topics: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(window)),
            recent_by_topic: DashMap::new(),
            strategies: DashMap::new(),
            strategy_ids: DashMap::new(),
            store: None,
            window: window.max(1),
            history_limit,
            published: AtomicU64::new(0),
        }
    }

    /// Serve join snapshots from the backing store, falling back to the
    /// in-memory window while it is unreachable.
    pub fn with_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn register(&self, conn: ConnId, tx: mpsc::Sender<String>) {
        self.connections.insert(conn, tx);
    }

    /// Add `conn` to `topic` without sending anything.
    pub fn subscribe(&self, conn: &ConnId, topic: &str) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(conn.clone());
    }

    /// Add `conn` to `topic` and send the topic's recent history to that
    /// connection alone, followed by the current strategy state if known.
    pub fn join(&self, conn: &ConnId, topic: &str) {
        self.subscribe(conn, topic);
        debug!(conn_id = %conn, topic, "joined topic");

        let history = ServerFrame::RecentHistory {
            game_name: topic.to_string(),
            events: self.snapshot(topic),
        };
        self.send_to(conn, history.to_json());

        if topic != WILDCARD_TOPIC {
            if let Some(current) = self.current_strategy(topic) {
                self.send_to(conn, ServerFrame::StrategyUpdate(current).to_json());
            }
        }
    }

    /// Remove `conn` from `topic`. Returns whether it was a member.
    pub fn leave(&self, conn: &ConnId, topic: &str) -> bool {
        let removed = self
            .topics
            .get_mut(topic)
            .map(|mut set| set.remove(conn))
            .unwrap_or(false);
        self.topics.remove_if(topic, |_, set| set.is_empty());
        debug!(conn_id = %conn, topic, removed, "left topic");
        removed
    }

    /// Drop `conn` and remove it from every topic.
    pub fn disconnect(&self, conn: &ConnId) {
        self.connections.remove(conn);
        self.topics.iter_mut().for_each(|mut set| {
            set.remove(conn);
        });
        self.topics.retain(|_, set| !set.is_empty());
    }

    /// Deliver `event` to every connection in `topic`, then separately to
    /// every connection in the wildcard topic. A connection in both receives
    /// it twice. Publishing to `*` itself delivers once.
    ///
    /// A strategy annotation no newer than the game's current one is dropped
    /// without delivery. Returns whether the event was fanned out.
    pub fn publish_event(&self, topic: &str, event: RelayEvent) -> bool {
        if let RelayEvent::Strategy(s) = &event {
            if !self.advance_strategy(s) {
                debug!(topic, game_id = %s.game_id, "stale strategy annotation dropped");
                return false;
            }
        }
        self.remember(&event);
        let payload = ServerFrame::from(&event).to_json();

        let mut closed = Vec::new();
        let mut deliveries = self.deliver(topic, &payload, &mut closed);
        if topic != WILDCARD_TOPIC {
            deliveries += self.deliver(WILDCARD_TOPIC, &payload, &mut closed);
        }
        for conn in closed {
            self.disconnect(&conn);
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(topic, deliveries, "event published");
        true
    }

    /// Newest relayed events across all topics, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<RelayEvent> {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.iter().rev().take(limit).cloned().collect()
    }

    /// Latest annotation for the game currently named `game_name`.
    pub fn current_strategy(&self, game_name: &str) -> Option<StrategyStateEvent> {
        let game_id = self.strategy_ids.get(game_name)?.clone();
        self.strategies.get(&game_id).map(|s| s.clone())
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    // --- private helpers ---------------------------------------------------

    /// Queue `payload` for every member of `topic`. Returns how many were
    /// attempted; members with a closed queue are collected into `closed`.
    fn deliver(&self, topic: &str, payload: &str, closed: &mut Vec<ConnId>) -> usize {
        let Some(members) = self.topics.get(topic) else {
            return 0;
        };
        for conn in members.iter() {
            let Some(tx) = self.connections.get(conn) else {
                continue;
            };
            match tx.try_send(payload.to_string()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(conn_id = %conn, topic, "outbound queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(conn.clone()),
            }
        }
        members.len()
    }

    fn send_to(&self, conn: &ConnId, payload: String) {
        if let Some(tx) = self.connections.get(conn) {
            if tx.try_send(payload).is_err() {
                warn!(conn_id = %conn, "could not queue direct frame");
            }
        }
    }

    /// Make `s` the current annotation for its game if it is strictly newer.
    fn advance_strategy(&self, s: &StrategyStateEvent) -> bool {
        match self.strategies.entry(s.game_id.clone()) {
            Entry::Occupied(cur) if cur.get().observed_at >= s.observed_at => return false,
            Entry::Occupied(mut cur) => {
                cur.insert(s.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(s.clone());
            }
        }
        self.strategy_ids.insert(s.game_name.clone(), s.game_id.clone());
        true
    }

    fn remember(&self, event: &RelayEvent) {
        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            recent.push_back(event.clone());
            while recent.len() > self.window {
                recent.pop_front();
            }
        }
        if let RelayEvent::Outcome(o) = event {
            let mut window = self.recent_by_topic.entry(o.game_name.clone()).or_default();
            window.push_back(o.clone());
            while window.len() > self.window {
                window.pop_front();
            }
        }
    }

    /// Join snapshot, newest first.
    fn snapshot(&self, topic: &str) -> Vec<OutcomeEvent> {
        if topic == WILDCARD_TOPIC {
            return self
                .recent_events(self.history_limit)
                .into_iter()
                .filter_map(|ev| match ev {
                    RelayEvent::Outcome(o) => Some(o),
                    RelayEvent::Strategy(_) => None,
                })
                .collect();
        }

        if let Some(store) = &self.store {
            match store.recent_for_game(topic, self.history_limit) {
                Ok(rows) => return rows.iter().filter_map(|r| r.to_event()).collect(),
                Err(e) => warn!(topic, error = %e, "history lookup failed, using memory window"),
            }
        }

        self.recent_by_topic
            .get(topic)
            .map(|w| w.iter().rev().take(self.history_limit).cloned().collect())
            .unwrap_or_default()
    }
}

impl Publisher for Broadcaster {
    fn publish(&self, topic: &str, event: RelayEvent) {
        self.publish_event(topic, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use runcash_core::StrategyState;

    fn outcome(game: &str, value: u8, secs: i64) -> RelayEvent {
        RelayEvent::Outcome(
            OutcomeEvent::new(game, game, value, Utc.timestamp_opt(secs, 0).unwrap()).unwrap(),
        )
    }

    fn strategy(game_id: &str, game: &str, state: StrategyState, secs: i64) -> RelayEvent {
        RelayEvent::Strategy(StrategyStateEvent {
            game_id: game_id.into(),
            game_name: game.into(),
            state,
            trigger_value: None,
            recommended_values: vec![],
            wins: 0,
            losses: 0,
            display_text: String::new(),
            observed_at: Utc.timestamp_opt(secs, 0).unwrap(),
        })
    }

    fn connect(b: &Broadcaster) -> (ConnId, mpsc::Receiver<String>) {
        let id = ConnId::new();
        let (tx, rx) = mpsc::channel(32);
        b.register(id.clone(), tx);
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    #[test]
    fn join_sends_history_to_joiner_only() {
        let b = Broadcaster::new(20, 20);
        b.publish_event("A", outcome("A", 1, 1));
        b.publish_event("A", outcome("A", 2, 2));

        let (a, mut rx_a) = connect(&b);
        let (other, mut rx_other) = connect(&b);
        b.subscribe(&other, "A");
        b.join(&a, "A");

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "recent_history");
        assert_eq!(frames[0]["events"][0]["value"], 2);
        assert!(drain(&mut rx_other).is_empty());
    }

    #[test]
    fn topic_isolation() {
        let b = Broadcaster::new(20, 20);
        let (a, mut rx_a) = connect(&b);
        b.subscribe(&a, "A");

        b.publish_event("B", outcome("B", 5, 1));
        assert!(drain(&mut rx_a).is_empty());

        b.publish_event("A", outcome("A", 5, 2));
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[test]
    fn wildcard_and_topic_member_gets_two_copies() {
        let b = Broadcaster::new(20, 20);
        let (a, mut rx_a) = connect(&b);
        b.subscribe(&a, "A");
        b.subscribe(&a, WILDCARD_TOPIC);

        b.publish_event("A", outcome("A", 5, 1));
        assert_eq!(drain(&mut rx_a).len(), 2);

        b.publish_event(WILDCARD_TOPIC, outcome("A", 6, 2));
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[test]
    fn disconnect_removes_from_every_topic() {
        let b = Broadcaster::new(20, 20);
        let (a, _rx) = connect(&b);
        b.subscribe(&a, "A");
        b.subscribe(&a, "B");
        b.subscribe(&a, WILDCARD_TOPIC);
        assert_eq!(b.topic_count(), 3);

        b.disconnect(&a);
        assert_eq!(b.subscriber_count("A"), 0);
        assert_eq!(b.topic_count(), 0);
        assert_eq!(b.connection_count(), 0);
    }

    #[test]
    fn leave_stops_delivery() {
        let b = Broadcaster::new(20, 20);
        let (a, mut rx_a) = connect(&b);
        b.subscribe(&a, "A");
        assert!(b.leave(&a, "A"));
        assert!(!b.leave(&a, "A"));
        b.publish_event("A", outcome("A", 5, 1));
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn closed_receiver_is_pruned_on_publish() {
        let b = Broadcaster::new(20, 20);
        let (a, rx_a) = connect(&b);
        b.subscribe(&a, "A");
        drop(rx_a);
        b.publish_event("A", outcome("A", 5, 1));
        assert_eq!(b.connection_count(), 0);
    }

    #[test]
    fn recent_window_is_bounded_newest_first() {
        let b = Broadcaster::new(3, 3);
        for i in 0..5u8 {
            b.publish_event("A", outcome("A", i, i as i64));
        }
        let values: Vec<u8> = b
            .recent_events(10)
            .into_iter()
            .filter_map(|e| match e {
                RelayEvent::Outcome(o) => Some(o.value),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![4, 3, 2]);
    }

    #[test]
    fn older_strategy_annotation_never_replaces_newer() {
        let b = Broadcaster::new(20, 20);
        let (a, mut rx_a) = connect(&b);
        b.subscribe(&a, "A");

        assert!(b.publish_event("A", strategy("g-a", "A", StrategyState::Armed, 20)));
        assert!(!b.publish_event("A", strategy("g-a", "A", StrategyState::Exhausted, 10)));
        assert!(!b.publish_event("A", strategy("g-a", "A", StrategyState::Neutral, 20)));

        let current = b.current_strategy("A").unwrap();
        assert_eq!(current.observed_at.timestamp(), 20);
        assert_eq!(current.state, StrategyState::Armed);

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "strategy_update");

        assert!(b.publish_event("A", strategy("g-a", "A", StrategyState::Exhausted, 30)));
        assert_eq!(b.current_strategy("A").unwrap().state, StrategyState::Exhausted);
    }

    #[test]
    fn strategy_state_is_kept_per_game_id() {
        let b = Broadcaster::new(20, 20);
        b.publish_event("A", strategy("g-a", "A", StrategyState::Armed, 20));
        // Same display name, different game: its own latest-wins slot.
        assert!(b.publish_event("A", strategy("g-b", "A", StrategyState::Neutral, 5)));
        assert_eq!(b.current_strategy("A").unwrap().game_id, "g-b");
        assert!(!b.publish_event("A", strategy("g-a", "A", StrategyState::Neutral, 10)));
    }

    #[test]
    fn join_sends_current_strategy_after_history() {
        let b = Broadcaster::new(20, 20);
        b.publish_event("A", strategy("g-a", "A", StrategyState::Armed, 20));
        b.publish_event("A", strategy("g-a", "A", StrategyState::Exhausted, 10));

        let (a, mut rx_a) = connect(&b);
        b.join(&a, "A");
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "recent_history");
        assert_eq!(frames[1]["type"], "strategy_update");
        assert_eq!(frames[1]["state"], "ARMED");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn membership_changes_race_safely_with_publish() {
        let b = Arc::new(Broadcaster::new(20, 20));
        let (stayer, mut rx_stayer) = connect(&b);
        b.subscribe(&stayer, "A");

        let publisher = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                for i in 0..500i64 {
                    b.publish_event("A", outcome("A", (i % 37) as u8, i));
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut churners = Vec::new();
        for n in 0..8 {
            let b = Arc::clone(&b);
            churners.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let id = ConnId::new();
                    let (tx, mut rx) = mpsc::channel(1024);
                    b.register(id.clone(), tx);
                    b.subscribe(&id, "A");
                    tokio::task::yield_now().await;
                    if n % 2 == 0 {
                        b.leave(&id, "A");
                    } else {
                        b.disconnect(&id);
                    }
                    while rx.try_recv().is_ok() {}
                    // Once out of the topic, nothing further may arrive.
                    tokio::task::yield_now().await;
                    assert!(rx.try_recv().is_err());
                    b.disconnect(&id);
                }
            }));
        }

        for c in churners {
            c.await.unwrap();
        }
        publisher.await.unwrap();

        assert_eq!(b.subscriber_count("A"), 1);
        assert_eq!(b.connection_count(), 1);
        assert_eq!(b.published_count(), 500);
        let mut received = 0;
        while rx_stayer.try_recv().is_ok() {
            received += 1;
        }
        assert!(received > 0);
    }
}
