//! Normalization of inbound payloads into [`RelayEvent`]s.
//!
//! Each transport has exactly one entry point here. All of them accept both
//! the current flat camelCase shape and the legacy producer field names, and
//! all of them recompute `category` from `value`.

use chrono::{DateTime, TimeZone, Utc};
use runcash_core::types::fallback_display_text;
use runcash_core::{OutcomeEvent, RelayEvent, StrategyState, StrategyStateEvent};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::frames::{CONNECTION_STATUS, NEW_NUMBER, PING, RECENT_HISTORY, STRATEGY_UPDATE};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown frame type '{0}'")]
    UnknownType(String),

    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Loose view over every shape a producer or relay has ever emitted.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LooseRecord {
    #[serde(rename = "type", alias = "event")]
    kind: Option<String>,
    #[serde(alias = "game_id", alias = "roleta_id")]
    game_id: Option<Value>,
    #[serde(alias = "game_name", alias = "roleta_nome")]
    game_name: Option<String>,
    #[serde(alias = "numero", alias = "number")]
    value: Option<Value>,
    #[serde(alias = "estado", alias = "estado_estrategia")]
    state: Option<String>,
    #[serde(alias = "trigger_value", alias = "numero_gatilho")]
    trigger_value: Option<Value>,
    #[serde(alias = "recommended_values", alias = "terminais_gatilho")]
    recommended_values: Option<Vec<Value>>,
    #[serde(alias = "vitorias")]
    wins: Option<u32>,
    #[serde(alias = "derrotas")]
    losses: Option<u32>,
    #[serde(alias = "display_text", alias = "sugestao_display")]
    display_text: Option<String>,
    #[serde(alias = "observedAt", alias = "created_at", alias = "updated_at")]
    timestamp: Option<Value>,
    /// Payload nested under `data` (ingest envelopes, some SSE producers).
    data: Option<Value>,
    /// `recent_history` body.
    events: Option<Vec<Value>>,
}

/// Decode one push-stream `data:` payload. `Ok(None)` means a control frame
/// (ping, status) that carries no event.
pub fn decode_stream_data(data: &str) -> Result<Option<RelayEvent>, DecodeError> {
    let value: Value = serde_json::from_str(data)?;
    decode_value(value)
}

/// Decode a polling response: either a bare array or `{ "events": [...] }`
/// / `{ "data": [...] }`. Malformed entries are skipped, not fatal.
pub fn decode_poll_body(body: &str) -> Result<Vec<RelayEvent>, DecodeError> {
    let value: Value = serde_json::from_str(body)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("events").or_else(|| map.remove("data")) {
            Some(Value::Array(items)) => items,
            _ => return Err(DecodeError::Malformed("poll body has no event list".into())),
        },
        _ => return Err(DecodeError::Malformed("poll body is not a list".into())),
    };
    Ok(decode_many(items))
}

/// Decode one managed-socket text frame. A `recent_history` reply expands to
/// many outcome events, returned newest first.
pub fn decode_socket_frame(text: &str) -> Result<Vec<RelayEvent>, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let is_history = value.get("type").and_then(Value::as_str) == Some(RECENT_HISTORY);
    if !is_history {
        return Ok(decode_value(value)?.into_iter().collect());
    }

    let record: LooseRecord = serde_json::from_value(value)?;
    let topic = record.game_name.unwrap_or_default();
    let mut events: Vec<RelayEvent> = decode_many(record.events.unwrap_or_default())
        .into_iter()
        .map(|ev| match ev {
            RelayEvent::Outcome(mut o) if o.game_name.is_empty() => {
                o.game_name = topic.clone();
                RelayEvent::Outcome(o)
            }
            other => other,
        })
        .collect();
    events.sort_by_key(|ev| std::cmp::Reverse(ev.observed_at()));
    Ok(events)
}

/// Decode an ingest body `{ "event": "new_number", "data": {...} }` or a bare
/// event object.
pub fn decode_ingest(body: &Value) -> Result<RelayEvent, DecodeError> {
    decode_value(body.clone())?
        .ok_or_else(|| DecodeError::Malformed("ingest body carries no event".into()))
}

fn decode_many(items: Vec<Value>) -> Vec<RelayEvent> {
    items
        .into_iter()
        .filter_map(|item| decode_value(item).ok().flatten())
        .collect()
}

fn decode_value(value: Value) -> Result<Option<RelayEvent>, DecodeError> {
    let mut record: LooseRecord = serde_json::from_value(value)?;

    // envelope: { event|type, data: {...} }
    if let Some(Value::Object(inner)) = record.data.take() {
        let kind = record.kind.take();
        let mut nested: LooseRecord = serde_json::from_value(Value::Object(inner))?;
        if nested.kind.is_none() {
            nested.kind = kind;
        }
        record = nested;
    }

    match record.kind.as_deref() {
        Some(NEW_NUMBER) | Some("new-number") | Some("number") => outcome(record).map(Some),
        Some(STRATEGY_UPDATE) | Some("strategy-update") | Some("strategy") => {
            strategy(record).map(Some)
        }
        Some(PING) | Some(CONNECTION_STATUS) | Some("heartbeat") | Some("connected") => Ok(None),
        Some(other) => Err(DecodeError::UnknownType(other.to_string())),
        None if record.state.is_some() => strategy(record).map(Some),
        None if record.value.is_some() => outcome(record).map(Some),
        None => Err(DecodeError::Malformed("no type and no recognizable fields".into())),
    }
}

fn outcome(r: LooseRecord) -> Result<RelayEvent, DecodeError> {
    let game_name = r
        .game_name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| DecodeError::Malformed("missing gameName".into()))?;
    let game_id = id_string(r.game_id).unwrap_or_else(|| game_name.clone());
    let value = r
        .value
        .as_ref()
        .and_then(as_small_int)
        .ok_or_else(|| DecodeError::Malformed("missing or invalid value".into()))?;
    let observed_at = r.timestamp.as_ref().and_then(parse_timestamp).unwrap_or_else(Utc::now);

    OutcomeEvent::new(game_id, game_name, value, observed_at)
        .map(RelayEvent::Outcome)
        .ok_or_else(|| DecodeError::Malformed(format!("value {value} out of range")))
}

fn strategy(r: LooseRecord) -> Result<RelayEvent, DecodeError> {
    let game_name = r
        .game_name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| DecodeError::Malformed("missing gameName".into()))?;
    let game_id = id_string(r.game_id).unwrap_or_else(|| game_name.clone());
    let state = match r.state.as_deref() {
        None => StrategyState::Neutral,
        Some(s) => s.parse().map_err(DecodeError::Malformed)?,
    };
    let recommended_values: Vec<u8> = r
        .recommended_values
        .unwrap_or_default()
        .iter()
        .filter_map(as_small_int)
        .collect();
    let display_text = r
        .display_text
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| fallback_display_text(state, &recommended_values));

    Ok(RelayEvent::Strategy(StrategyStateEvent {
        game_id,
        game_name,
        state,
        trigger_value: r.trigger_value.as_ref().and_then(as_small_int),
        recommended_values,
        wins: r.wins.unwrap_or(0),
        losses: r.losses.unwrap_or(0),
        display_text,
        observed_at: r.timestamp.as_ref().and_then(parse_timestamp).unwrap_or_else(Utc::now),
    }))
}

fn id_string(v: Option<Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_small_int(v: &Value) -> Option<u8> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// RFC 3339 string, or epoch milliseconds as a number.
pub fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
