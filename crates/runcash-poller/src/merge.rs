use std::collections::HashMap;

use runcash_core::{StrategyState, StrategyStateEvent};
use runcash_store::AnnotationRecord;

/// Keep, per `game_id`, the single newest annotation across every source.
/// On equal timestamps the first record seen wins.
pub fn newest_per_game(records: Vec<AnnotationRecord>) -> Vec<AnnotationRecord> {
    let mut latest: HashMap<String, AnnotationRecord> = HashMap::new();
    for rec in records {
        match latest.get(&rec.game_id) {
            Some(cur) if cur.recorded_at >= rec.recorded_at => {}
            _ => {
                latest.insert(rec.game_id.clone(), rec);
            }
        }
    }
    let mut out: Vec<_> = latest.into_values().collect();
    out.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.game_id.cmp(&b.game_id)));
    out
}

/// Convert a raw annotation. Missing state means `NEUTRAL`; an unknown state
/// label is an error and the record is dropped by the caller.
pub fn to_event(rec: AnnotationRecord) -> Result<StrategyStateEvent, String> {
    let state = match rec.state.as_deref() {
        None => StrategyState::Neutral,
        Some(label) => label.parse()?,
    };
    let event = StrategyStateEvent {
        game_id: rec.game_id,
        game_name: rec.game_name,
        state,
        trigger_value: rec.trigger_value.and_then(|v| u8::try_from(v).ok()),
        recommended_values: rec
            .recommended_values
            .into_iter()
            .filter_map(|v| u8::try_from(v).ok())
            .collect(),
        wins: rec.wins,
        losses: rec.losses,
        display_text: rec.display_text.unwrap_or_default(),
        observed_at: rec.recorded_at,
    };
    Ok(event.with_fallback_display())
}
