use rusqlite::Connection;

use crate::error::Result;

/// Initialise the outcome, per-game and strategy-history tables.
///
/// Safe to call on every startup: uses `IF NOT EXISTS` throughout.
/// Timestamps are RFC 3339 UTC text so lexical order is chronological.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS outcomes (
            id          TEXT PRIMARY KEY,
            game_id     TEXT NOT NULL,
            game_name   TEXT NOT NULL,
            value       INTEGER NOT NULL,
            color       TEXT,
            recorded_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_outcomes_recent
            ON outcomes(recorded_at DESC);
        CREATE INDEX IF NOT EXISTS idx_outcomes_game
            ON outcomes(game_name, recorded_at DESC);

        CREATE TABLE IF NOT EXISTS games (
            id                 TEXT PRIMARY KEY,
            name               TEXT NOT NULL,
            strategy_state     TEXT,
            trigger_value      INTEGER,
            recommended_values TEXT,
            wins               INTEGER NOT NULL DEFAULT 0,
            losses             INTEGER NOT NULL DEFAULT 0,
            display_text       TEXT,
            updated_at         TEXT
        );

        CREATE TABLE IF NOT EXISTS strategy_history (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            game_id            TEXT NOT NULL,
            game_name          TEXT NOT NULL,
            state              TEXT,
            trigger_value      INTEGER,
            recommended_values TEXT,
            wins               INTEGER NOT NULL DEFAULT 0,
            losses             INTEGER NOT NULL DEFAULT 0,
            display_text       TEXT,
            recorded_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_strategy_history_recent
            ON strategy_history(recorded_at DESC);",
    )?;
    Ok(())
}
