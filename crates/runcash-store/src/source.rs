use crate::error::Result;
use crate::types::{AnnotationRecord, GameSummary, OutcomeRecord};

/// Read-only query surface over the backing store.
///
/// The relay never writes outcomes or strategy state through this trait.
pub trait OutcomeSource: Send {
    /// Newest `limit` outcome rows across all games, newest first.
    fn latest_outcomes(&self, limit: usize) -> Result<Vec<OutcomeRecord>>;

    /// Current annotations from every source. Per-game rows are returned in
    /// full; the append-only history contributes its newest `limit` rows.
    fn latest_annotations(&self, limit: usize) -> Result<Vec<AnnotationRecord>>;

    /// Newest `limit` outcome rows for one game name, newest first.
    fn recent_for_game(&self, game_name: &str, limit: usize) -> Result<Vec<OutcomeRecord>>;

    /// Same as `recent_for_game`, keyed by the stable game id.
    fn recent_for_game_id(&self, game_id: &str, limit: usize) -> Result<Vec<OutcomeRecord>>;

    /// Every known game.
    fn games(&self) -> Result<Vec<GameSummary>>;

    /// Cheap round trip used to confirm the connection is still usable.
    fn ping(&self) -> Result<()>;
}

/// Opens new [`OutcomeSource`] handles; used by [`crate::StoreLink`] to
/// reconnect after a failure.
pub trait Connector: Send + Sync {
    type Source: OutcomeSource;

    fn connect(&self) -> Result<Self::Source>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}
