use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::source::{Connector, OutcomeSource};
use crate::types::{GameSummary, OutcomeRecord};

/// Object-safe view of a [`StoreLink`] for HTTP handlers and the broadcaster,
/// which do not care about the concrete connector.
pub trait SharedStore: Send + Sync {
    fn recent_for_game(&self, game_name: &str, limit: usize) -> Result<Vec<OutcomeRecord>>;
    fn recent_for_game_id(&self, game_id: &str, limit: usize) -> Result<Vec<OutcomeRecord>>;
    fn games(&self) -> Result<Vec<GameSummary>>;
    fn is_connected(&self) -> bool;
}

/// Reconnecting handle to the backing store.
///
/// Holds at most one open source. Every call connects first if needed; a
/// connection-level failure drops the source so the next call re-opens it.
/// Callers never block on a reconnect loop: each call makes one attempt.
///
/// Outcome reads made through the link fill a missing `recorded_at` with the
/// time the row was first read, so every later read of that row carries the
/// same stamp.
pub struct StoreLink<C: Connector> {
    connector: C,
    source: Mutex<Option<C::Source>>,
    connected: AtomicBool,
    stamps: Mutex<StampBook>,
}

const DEFAULT_STAMP_CAPACITY: usize = 2048;

impl<C: Connector> StoreLink<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            source: Mutex::new(None),
            connected: AtomicBool::new(false),
            stamps: Mutex::new(StampBook::new(DEFAULT_STAMP_CAPACITY)),
        }
    }

    /// How many first-read stamps to remember for untimestamped rows.
    pub fn with_stamp_capacity(self, capacity: usize) -> Self {
        *self.stamps.lock().unwrap_or_else(|e| e.into_inner()) = StampBook::new(capacity);
        self
    }

    /// Newest outcome rows across all games, newest first, every row stamped.
    pub fn latest_outcomes(&self, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let rows = self.with(|s| s.latest_outcomes(limit))?;
        Ok(self.stamp(rows))
    }

    /// Whether the last operation left a usable connection in place.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Run `f` against the open source, connecting first when necessary.
    pub fn with<T>(&self, f: impl FnOnce(&C::Source) -> Result<T>) -> Result<T> {
        let mut guard = self.source.lock().unwrap_or_else(|e| e.into_inner());

        if guard.is_none() {
            match self.connector.connect() {
                Ok(source) => {
                    info!(store = %self.connector.describe(), "backing store connected");
                    *guard = Some(source);
                    self.connected.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    self.connected.store(false, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        let source = guard
            .as_ref()
            .ok_or_else(|| StoreError::Disconnected("no source after connect".into()))?;

        match f(source) {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_connection_loss() {
                    warn!(error = %e, "backing store connection dropped");
                    *guard = None;
                    self.connected.store(false, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    /// Probe the connection, reconnecting if needed. Returns the new state.
    pub fn check(&self) -> bool {
        self.with(|s| s.ping()).is_ok()
    }

    fn stamp(&self, mut rows: Vec<OutcomeRecord>) -> Vec<OutcomeRecord> {
        if rows.iter().all(|r| r.recorded_at.is_some()) {
            return rows;
        }
        let now = Utc::now();
        let mut book = self.stamps.lock().unwrap_or_else(|e| e.into_inner());
        for row in rows.iter_mut().filter(|r| r.recorded_at.is_none()) {
            let at = book.get_or_insert(&row.id, now);
            debug!(record_id = %row.id, %at, "untimestamped outcome stamped");
            row.recorded_at = Some(at);
        }
        rows
    }
}

/// Bounded record id to first-read time map; the oldest id is evicted first.
struct StampBook {
    order: VecDeque<String>,
    stamps: HashMap<String, DateTime<Utc>>,
    capacity: usize,
}

impl StampBook {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            stamps: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn get_or_insert(&mut self, id: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = self.stamps.get(id) {
            return *at;
        }
        self.stamps.insert(id.to_string(), now);
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.stamps.remove(&old);
            }
        }
        now
    }
}

impl<C: Connector> SharedStore for StoreLink<C> {
    fn recent_for_game(&self, game_name: &str, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let rows = self.with(|s| s.recent_for_game(game_name, limit))?;
        Ok(self.stamp(rows))
    }

    fn recent_for_game_id(&self, game_id: &str, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let rows = self.with(|s| s.recent_for_game_id(game_id, limit))?;
        Ok(self.stamp(rows))
    }

    fn games(&self) -> Result<Vec<GameSummary>> {
        self.with(|s| s.games())
    }

    fn is_connected(&self) -> bool {
        StoreLink::is_connected(self)
    }
}
