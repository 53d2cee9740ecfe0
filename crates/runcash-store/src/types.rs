use chrono::{DateTime, Utc};
use runcash_core::OutcomeEvent;
use serde::{Deserialize, Serialize};

/// One raw outcome row, as stored by the upstream producer.
///
/// `value` is kept wide here; range checks and classification happen in the
/// poller so a single bad row never fails a whole query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub id: String,
    pub game_id: String,
    pub game_name: String,
    pub value: i64,
    /// `None` when the producer did not stamp the row.
    pub recorded_at: Option<DateTime<Utc>>,
}

impl OutcomeRecord {
    /// Classified event for this row, or `None` when `value` is off the wheel
    /// or the row was never stamped. Rows read through a `StoreLink` always
    /// carry a stamp.
    pub fn to_event(&self) -> Option<OutcomeEvent> {
        let value = u8::try_from(self.value).ok()?;
        OutcomeEvent::new(
            self.game_id.clone(),
            self.game_name.clone(),
            value,
            self.recorded_at?,
        )
    }
}

/// Which upstream collection an annotation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationOrigin {
    /// Current-state columns on the per-game row.
    GameRow,
    /// Append-only strategy history.
    History,
}

/// One raw strategy annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub origin: AnnotationOrigin,
    pub game_id: String,
    pub game_name: String,
    /// Unparsed state label; `None` when the producer left it empty.
    pub state: Option<String>,
    pub trigger_value: Option<i64>,
    pub recommended_values: Vec<i64>,
    pub wins: u32,
    pub losses: u32,
    pub display_text: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSummary {
    pub id: String,
    pub name: String,
}
