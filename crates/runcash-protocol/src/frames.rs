use chrono::{DateTime, Utc};
use runcash_core::{OutcomeEvent, RelayEvent, StrategyStateEvent};
use serde::{Deserialize, Serialize};

pub const NEW_NUMBER: &str = "new_number";
pub const STRATEGY_UPDATE: &str = "strategy_update";
pub const RECENT_HISTORY: &str = "recent_history";
pub const CONNECTION_STATUS: &str = "connection_status";
pub const PING: &str = "ping";
pub const ERROR: &str = "error";

/// Server → Client frame.
///
/// Event frames are flat: `{ "type": "new_number", "gameId": "...", "gameName": "...",
/// "value": 32, "category": "red", "timestamp": "..." }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    NewNumber(OutcomeEvent),
    StrategyUpdate(StrategyStateEvent),
    /// Reply sent to one connection right after it joins a topic, newest first.
    RecentHistory {
        #[serde(rename = "gameName")]
        game_name: String,
        events: Vec<OutcomeEvent>,
    },
    ConnectionStatus {
        connected: bool,
        #[serde(rename = "storeConnected")]
        store_connected: bool,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn ping() -> Self {
        ServerFrame::Ping {
            timestamp: Utc::now(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Serialized frame text. Every variant is plain data, so this cannot fail
    /// in practice; a failure degrades to an empty object.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl From<&RelayEvent> for ServerFrame {
    fn from(ev: &RelayEvent) -> Self {
        match ev {
            RelayEvent::Outcome(o) => ServerFrame::NewNumber(o.clone()),
            RelayEvent::Strategy(s) => ServerFrame::StrategyUpdate(s.clone()),
        }
    }
}

impl From<RelayEvent> for ServerFrame {
    fn from(ev: RelayEvent) -> Self {
        match ev {
            RelayEvent::Outcome(o) => ServerFrame::NewNumber(o),
            RelayEvent::Strategy(s) => ServerFrame::StrategyUpdate(s),
        }
    }
}
