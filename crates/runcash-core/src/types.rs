use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Topic every viewer can join to receive events for all games.
pub const WILDCARD_TOPIC: &str = "*";

/// Highest value on a 37-slot wheel.
pub const MAX_VALUE: u8 = 36;

const RED_VALUES: [u8; 18] = [
    1, 3, 5, 7, 9, 12, 14, 16, 18, 19, 21, 23, 25, 27, 30, 32, 34, 36,
];

/// Identifier for one viewer connection (UUIDv7, sortable in logs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub String);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Colour classification of a drawn value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Green,
    Red,
    Black,
}

impl Category {
    /// Classify a value on the standard single-zero layout.
    ///
    /// Returns `None` for values outside `0..=36`; such records are malformed.
    pub fn of(value: u8) -> Option<Self> {
        match value {
            0 => Some(Category::Green),
            v if v > MAX_VALUE => None,
            v if RED_VALUES.contains(&v) => Some(Category::Red),
            _ => Some(Category::Black),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Green => "green",
            Category::Red => "red",
            Category::Black => "black",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed draw.
///
/// `category` is always derived from `value` by [`OutcomeEvent::new`]; any
/// colour supplied by an upstream producer is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeEvent {
    pub game_id: String,
    pub game_name: String,
    pub value: u8,
    pub category: Category,
    #[serde(rename = "timestamp")]
    pub observed_at: DateTime<Utc>,
}

impl OutcomeEvent {
    pub fn new(
        game_id: impl Into<String>,
        game_name: impl Into<String>,
        value: u8,
        observed_at: DateTime<Utc>,
    ) -> Option<Self> {
        Some(Self {
            game_id: game_id.into(),
            game_name: game_name.into(),
            value,
            category: Category::of(value)?,
            observed_at,
        })
    }
}

/// Closed set of strategy postures computed upstream.
///
/// Older producers write `TRIGGER`, `POST_GALE_NEUTRAL` and `MORTO`; they are
/// accepted as aliases of the canonical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyState {
    #[default]
    Neutral,
    #[serde(alias = "TRIGGER")]
    Armed,
    #[serde(alias = "POST_GALE_NEUTRAL")]
    CooldownArmed,
    #[serde(alias = "MORTO")]
    Exhausted,
}

impl StrategyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyState::Neutral => "NEUTRAL",
            StrategyState::Armed => "ARMED",
            StrategyState::CooldownArmed => "COOLDOWN_ARMED",
            StrategyState::Exhausted => "EXHAUSTED",
        }
    }
}

impl FromStr for StrategyState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEUTRAL" => Ok(StrategyState::Neutral),
            "ARMED" | "TRIGGER" => Ok(StrategyState::Armed),
            "COOLDOWN_ARMED" | "POST_GALE_NEUTRAL" => Ok(StrategyState::CooldownArmed),
            "EXHAUSTED" | "MORTO" => Ok(StrategyState::Exhausted),
            other => Err(format!("unknown strategy state '{other}'")),
        }
    }
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest strategy annotation for one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStateEvent {
    pub game_id: String,
    pub game_name: String,
    pub state: StrategyState,
    pub trigger_value: Option<u8>,
    #[serde(default)]
    pub recommended_values: Vec<u8>,
    #[serde(default)]
    pub wins: u32,
    #[serde(default)]
    pub losses: u32,
    #[serde(default)]
    pub display_text: String,
    #[serde(rename = "timestamp")]
    pub observed_at: DateTime<Utc>,
}

impl StrategyStateEvent {
    /// Fill `display_text` from the state when upstream left it blank.
    pub fn with_fallback_display(mut self) -> Self {
        if self.display_text.trim().is_empty() {
            self.display_text = fallback_display_text(self.state, &self.recommended_values);
        }
        self
    }
}

/// Fixed human summary per state.
pub fn fallback_display_text(state: StrategyState, recommended: &[u8]) -> String {
    let joined = recommended
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    match state {
        StrategyState::Neutral => "WAITING FOR TRIGGER".to_string(),
        StrategyState::Armed => format!("BET ON: {joined}"),
        StrategyState::CooldownArmed => format!("GALE ON: {joined}"),
        StrategyState::Exhausted => "WAITING FOR NEXT CYCLE".to_string(),
    }
}

/// Canonical event seen by subscribers, whatever transport carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Outcome(OutcomeEvent),
    Strategy(StrategyStateEvent),
}

impl RelayEvent {
    pub fn game_id(&self) -> &str {
        match self {
            RelayEvent::Outcome(e) => &e.game_id,
            RelayEvent::Strategy(e) => &e.game_id,
        }
    }

    /// Topic key. Topics are keyed by display name, not by id.
    pub fn topic(&self) -> &str {
        match self {
            RelayEvent::Outcome(e) => &e.game_name,
            RelayEvent::Strategy(e) => &e.game_name,
        }
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        match self {
            RelayEvent::Outcome(e) => e.observed_at,
            RelayEvent::Strategy(e) => e.observed_at,
        }
    }

    /// Stable identity used by consumers to drop the second copy of an event
    /// delivered on both its own topic and the wildcard.
    pub fn identity(&self) -> String {
        match self {
            RelayEvent::Outcome(e) => format!(
                "o:{}:{}:{}",
                e.game_id,
                e.value,
                e.observed_at.timestamp_millis()
            ),
            RelayEvent::Strategy(e) => format!(
                "s:{}:{}:{}",
                e.game_id,
                e.state.as_str(),
                e.observed_at.timestamp_millis()
            ),
        }
    }
}

impl From<OutcomeEvent> for RelayEvent {
    fn from(e: OutcomeEvent) -> Self {
        RelayEvent::Outcome(e)
    }
}

impl From<StrategyStateEvent> for RelayEvent {
    fn from(e: StrategyStateEvent) -> Self {
        RelayEvent::Strategy(e)
    }
}
