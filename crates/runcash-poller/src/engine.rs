use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use runcash_core::config::StoreConfig;
use runcash_core::dedup::DedupRing;
use runcash_core::{RelayEvent, StrategyStateEvent};
use runcash_store::{Connector, OutcomeSource, StoreLink};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::merge::{newest_per_game, to_event};

/// Fan-out sink the poller hands events to.
///
/// `publish` delivers to the event's own topic and, independently, to the
/// wildcard topic. It must not block.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, event: RelayEvent);
}

/// Producer loop: detects new outcome rows and newer strategy annotations.
pub struct PollerEngine<C: Connector> {
    link: Arc<StoreLink<C>>,
    publisher: Arc<dyn Publisher>,
    seen: DedupRing<String>,
    /// Latest relayed annotation per `game_id`.
    strategies: HashMap<String, StrategyStateEvent>,
    outcome_limit: usize,
    strategy_limit: usize,
    outcome_every: Duration,
    strategy_every: Duration,
}

impl<C: Connector> PollerEngine<C> {
    pub fn new(link: Arc<StoreLink<C>>, publisher: Arc<dyn Publisher>, cfg: &StoreConfig) -> Self {
        Self {
            link,
            publisher,
            seen: DedupRing::new(cfg.dedup_capacity.max(cfg.outcome_limit)),
            strategies: HashMap::new(),
            outcome_limit: cfg.outcome_limit,
            strategy_limit: cfg.strategy_limit,
            outcome_every: Duration::from_millis(cfg.outcome_interval_ms),
            strategy_every: Duration::from_millis(cfg.strategy_interval_ms),
        }
    }

    /// Main loop. Runs until `shutdown` broadcasts `true`.
    ///
    /// A tick that overruns its period causes the missed ticks to be skipped,
    /// never run back to back.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            outcome_ms = self.outcome_every.as_millis() as u64,
            strategy_ms = self.strategy_every.as_millis() as u64,
            "outcome poller started"
        );

        let mut outcomes = tokio::time::interval(self.outcome_every);
        outcomes.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut strategies = tokio::time::interval(self.strategy_every);
        strategies.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = outcomes.tick() => {
                    if let Err(e) = self.poll_outcomes() {
                        warn!(error = %e, "outcome poll failed, retrying next tick");
                    }
                }
                _ = strategies.tick() => {
                    if let Err(e) = self.poll_strategies() {
                        warn!(error = %e, "strategy poll failed, retrying next tick");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("outcome poller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One outcome tick. Returns how many events were published.
    ///
    /// Rows arrive newest first and are published oldest first, so order
    /// within a topic is chronological.
    pub fn poll_outcomes(&mut self) -> Result<usize> {
        let limit = self.outcome_limit;
        let records = self.link.latest_outcomes(limit)?;

        let mut emitted = 0;
        for rec in records.into_iter().rev() {
            if !self.seen.insert(rec.id.clone()) {
                continue;
            }
            let Some(event) = rec.to_event() else {
                warn!(
                    record_id = %rec.id,
                    value = rec.value,
                    "outcome value out of range, skipped"
                );
                continue;
            };

            debug!(
                game = %event.game_name,
                value = event.value,
                category = %event.category,
                "new outcome"
            );
            let topic = event.game_name.clone();
            self.publisher.publish(&topic, RelayEvent::Outcome(event));
            emitted += 1;
        }
        Ok(emitted)
    }

    /// One strategy tick. Publishes only annotations strictly newer than the
    /// one already relayed for that game.
    pub fn poll_strategies(&mut self) -> Result<usize> {
        let limit = self.strategy_limit;
        let records = self.link.with(|s| s.latest_annotations(limit))?;

        let mut emitted = 0;
        for rec in newest_per_game(records) {
            let game_id = rec.game_id.clone();
            let event = match to_event(rec) {
                Ok(ev) => ev,
                Err(reason) => {
                    warn!(game_id = %game_id, %reason, "strategy annotation dropped");
                    continue;
                }
            };
            if self
                .strategies
                .get(&game_id)
                .is_some_and(|cur| cur.observed_at >= event.observed_at)
            {
                continue;
            }

            debug!(game = %event.game_name, state = %event.state, "strategy update");
            self.strategies.insert(game_id, event.clone());
            let topic = event.game_name.clone();
            self.publisher.publish(&topic, RelayEvent::Strategy(event));
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Latest relayed annotation for a game.
    pub fn current_strategy(&self, game_id: &str) -> Option<&StrategyStateEvent> {
        self.strategies.get(game_id)
    }

    pub fn store_connected(&self) -> bool {
        self.link.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use runcash_core::{Category, StrategyState};
    use runcash_store::error::Result as StoreResult;
    use runcash_store::{
        AnnotationOrigin, AnnotationRecord, GameSummary, OutcomeRecord, StoreError,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        outcomes: Mutex<Vec<OutcomeRecord>>,
        annotations: Mutex<Vec<AnnotationRecord>>,
        down: AtomicBool,
    }

    struct FakeSource(Arc<Script>);

    impl OutcomeSource for FakeSource {
        fn latest_outcomes(&self, limit: usize) -> StoreResult<Vec<OutcomeRecord>> {
            if self.0.down.load(Ordering::SeqCst) {
                return Err(StoreError::Disconnected("down".into()));
            }
            let rows = self.0.outcomes.lock().unwrap();
            Ok(rows.iter().take(limit).cloned().collect())
        }
        fn latest_annotations(&self, _limit: usize) -> StoreResult<Vec<AnnotationRecord>> {
            Ok(self.0.annotations.lock().unwrap().clone())
        }
        fn recent_for_game(&self, _g: &str, _l: usize) -> StoreResult<Vec<OutcomeRecord>> {
            Ok(vec![])
        }
        fn recent_for_game_id(&self, _g: &str, _l: usize) -> StoreResult<Vec<OutcomeRecord>> {
            Ok(vec![])
        }
        fn games(&self) -> StoreResult<Vec<GameSummary>> {
            Ok(vec![])
        }
        fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    struct FakeConnector(Arc<Script>);

    impl Connector for FakeConnector {
        type Source = FakeSource;
        fn connect(&self) -> StoreResult<FakeSource> {
            if self.0.down.load(Ordering::SeqCst) {
                Err(StoreError::Disconnected("refused".into()))
            } else {
                Ok(FakeSource(self.0.clone()))
            }
        }
        fn describe(&self) -> String {
            "fake".into()
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, RelayEvent)>>);

    impl Publisher for Recorder {
        fn publish(&self, topic: &str, event: RelayEvent) {
            self.0.lock().unwrap().push((topic.to_string(), event));
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn row(id: &str, value: i64, secs: i64) -> OutcomeRecord {
        OutcomeRecord {
            id: id.into(),
            game_id: "g1".into(),
            game_name: "Lightning".into(),
            value,
            recorded_at: Some(ts(secs)),
        }
    }

    fn setup() -> (Arc<Script>, Arc<Recorder>, PollerEngine<FakeConnector>) {
        let script = Arc::new(Script::default());
        let recorder = Arc::new(Recorder::default());
        let link = Arc::new(StoreLink::new(FakeConnector(script.clone())));
        let engine = PollerEngine::new(link, recorder.clone(), &StoreConfig::default());
        (script, recorder, engine)
    }

    fn values(rec: &Recorder) -> Vec<(u8, Category)> {
        rec.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, e)| match e {
                RelayEvent::Outcome(o) => Some((o.value, o.category)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn two_tick_scenario_suppresses_seen_ids() {
        let (script, rec, mut engine) = setup();

        // newest first, as the store returns them
        *script.outcomes.lock().unwrap() = vec![row("2", 0, 11), row("1", 32, 10)];
        assert_eq!(engine.poll_outcomes().unwrap(), 2);
        assert_eq!(
            values(&rec),
            vec![(32, Category::Red), (0, Category::Green)]
        );

        *script.outcomes.lock().unwrap() = vec![row("3", 5, 12), row("2", 0, 11)];
        assert_eq!(engine.poll_outcomes().unwrap(), 1);
        assert_eq!(values(&rec).last(), Some(&(5, Category::Red)));
        assert_eq!(values(&rec).len(), 3);
    }

    #[test]
    fn repeated_ticks_are_idempotent() {
        let (script, rec, mut engine) = setup();
        *script.outcomes.lock().unwrap() = vec![row("a", 7, 3), row("b", 8, 2)];
        for _ in 0..5 {
            engine.poll_outcomes().unwrap();
        }
        assert_eq!(rec.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn events_are_published_on_game_topic() {
        let (script, rec, mut engine) = setup();
        *script.outcomes.lock().unwrap() = vec![row("x", 1, 1)];
        engine.poll_outcomes().unwrap();
        assert_eq!(rec.0.lock().unwrap()[0].0, "Lightning");
    }

    #[test]
    fn out_of_range_value_is_skipped_once() {
        let (script, rec, mut engine) = setup();
        *script.outcomes.lock().unwrap() = vec![row("bad", 99, 1)];
        assert_eq!(engine.poll_outcomes().unwrap(), 0);
        assert_eq!(engine.poll_outcomes().unwrap(), 0);
        assert!(rec.0.lock().unwrap().is_empty());
    }

    #[test]
    fn store_outage_is_an_error_then_recovers() {
        let (script, rec, mut engine) = setup();
        script.down.store(true, Ordering::SeqCst);
        *script.outcomes.lock().unwrap() = vec![row("1", 4, 1)];

        assert!(engine.poll_outcomes().is_err());
        assert!(!engine.store_connected());

        script.down.store(false, Ordering::SeqCst);
        assert_eq!(engine.poll_outcomes().unwrap(), 1);
        assert!(engine.store_connected());
        assert_eq!(rec.0.lock().unwrap().len(), 1);
    }

    fn ann(state: &str, secs: i64, origin: AnnotationOrigin) -> AnnotationRecord {
        AnnotationRecord {
            origin,
            game_id: "g1".into(),
            game_name: "Lightning".into(),
            state: Some(state.into()),
            trigger_value: Some(7),
            recommended_values: vec![7, 17],
            wins: 1,
            losses: 0,
            display_text: None,
            recorded_at: ts(secs),
        }
    }

    #[test]
    fn latest_strategy_wins_regardless_of_order() {
        let (script, rec, mut engine) = setup();

        *script.annotations.lock().unwrap() = vec![ann("ARMED", 20, AnnotationOrigin::GameRow)];
        assert_eq!(engine.poll_strategies().unwrap(), 1);

        // older annotation observed later is stale
        *script.annotations.lock().unwrap() = vec![ann("MORTO", 10, AnnotationOrigin::History)];
        assert_eq!(engine.poll_strategies().unwrap(), 0);
        assert_eq!(
            engine.current_strategy("g1").map(|s| s.state),
            Some(StrategyState::Armed)
        );

        // same timestamp again is not republished
        *script.annotations.lock().unwrap() = vec![ann("ARMED", 20, AnnotationOrigin::GameRow)];
        assert_eq!(engine.poll_strategies().unwrap(), 0);

        *script.annotations.lock().unwrap() = vec![
            ann("NEUTRAL", 25, AnnotationOrigin::GameRow),
            ann("POST_GALE_NEUTRAL", 30, AnnotationOrigin::History),
        ];
        assert_eq!(engine.poll_strategies().unwrap(), 1);
        assert_eq!(
            engine.current_strategy("g1").map(|s| s.state),
            Some(StrategyState::CooldownArmed)
        );
        assert_eq!(rec.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn unknown_state_is_dropped() {
        let (script, rec, mut engine) = setup();
        *script.annotations.lock().unwrap() = vec![ann("SOMETHING", 5, AnnotationOrigin::GameRow)];
        assert_eq!(engine.poll_strategies().unwrap(), 0);
        assert!(rec.0.lock().unwrap().is_empty());
        assert!(engine.current_strategy("g1").is_none());
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let (script, rec, engine) = setup();
        *script.outcomes.lock().unwrap() = vec![row("1", 4, 1)];
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        // first interval tick fires immediately
        assert_eq!(rec.0.lock().unwrap().len(), 1);
    }
}
