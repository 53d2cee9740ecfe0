use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{debug, instrument, warn};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::source::{Connector, OutcomeSource};
use crate::types::{AnnotationOrigin, AnnotationRecord, GameSummary, OutcomeRecord};

/// Opens the SQLite file the upstream producer writes into.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    create_schema: bool,
}

impl SqliteConnector {
    /// Read-only connector. A missing file is a connection failure.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_schema: false,
        }
    }

    /// Create the file and schema on first connect (local development).
    pub fn with_schema_init(mut self) -> Self {
        self.create_schema = true;
        self
    }
}

impl Connector for SqliteConnector {
    type Source = SqliteSource;

    fn connect(&self) -> Result<SqliteSource> {
        let conn = if self.create_schema {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Disconnected(e.to_string()))?;
            }
            let conn = Connection::open(&self.path)?;
            init_db(&conn)?;
            conn
        } else {
            Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        };
        conn.busy_timeout(Duration::from_millis(500))?;
        Ok(SqliteSource { conn })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

pub struct SqliteSource {
    conn: Connection,
}

impl SqliteSource {
    /// Wrap an already-open connection (tests, embedded use).
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl OutcomeSource for SqliteSource {
    #[instrument(skip(self))]
    fn latest_outcomes(&self, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, game_id, game_name, value, recorded_at
             FROM outcomes
             ORDER BY recorded_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], row_to_outcome)?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        debug!(count = records.len(), "fetched latest outcomes");
        Ok(records)
    }

    #[instrument(skip(self))]
    fn latest_annotations(&self, limit: usize) -> Result<Vec<AnnotationRecord>> {
        let mut out = Vec::new();

        let mut stmt = self.conn.prepare_cached(
            "SELECT id, name, strategy_state, trigger_value, recommended_values,
                    wins, losses, display_text, updated_at
             FROM games
             WHERE updated_at IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| row_to_annotation(row, AnnotationOrigin::GameRow))?;
        for row in rows {
            if let Some(rec) = row? {
                out.push(rec);
            }
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT game_id, game_name, state, trigger_value, recommended_values,
                    wins, losses, display_text, recorded_at
             FROM strategy_history
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            row_to_annotation(row, AnnotationOrigin::History)
        })?;
        for row in rows {
            if let Some(rec) = row? {
                out.push(rec);
            }
        }

        debug!(count = out.len(), "fetched strategy annotations");
        Ok(out)
    }

    #[instrument(skip(self))]
    fn recent_for_game(&self, game_name: &str, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, game_id, game_name, value, recorded_at
             FROM outcomes
             WHERE game_name = ?1
             ORDER BY recorded_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![game_name, limit as i64], row_to_outcome)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[instrument(skip(self))]
    fn recent_for_game_id(&self, game_id: &str, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, game_id, game_name, value, recorded_at
             FROM outcomes
             WHERE game_id = ?1
             ORDER BY recorded_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![game_id, limit as i64], row_to_outcome)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[instrument(skip(self))]
    fn games(&self) -> Result<Vec<GameSummary>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, name FROM games
             UNION
             SELECT DISTINCT game_id, game_name FROM outcomes
             ORDER BY 2",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(GameSummary {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(())
    }
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn row_to_outcome(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutcomeRecord> {
    Ok(OutcomeRecord {
        id: row.get(0)?,
        game_id: row.get(1)?,
        game_name: row.get(2)?,
        value: row.get(3)?,
        recorded_at: parse_time(row.get(4)?),
    })
}

/// Rows without a parseable timestamp cannot take part in latest-wins
/// ordering and are skipped.
fn row_to_annotation(
    row: &rusqlite::Row<'_>,
    origin: AnnotationOrigin,
) -> rusqlite::Result<Option<AnnotationRecord>> {
    let game_id: String = row.get(0)?;
    let Some(recorded_at) = parse_time(row.get(8)?) else {
        warn!(game_id = %game_id, ?origin, "annotation without valid timestamp skipped");
        return Ok(None);
    };
    let recommended: Option<String> = row.get(4)?;
    let recommended_values = recommended
        .as_deref()
        .map(|s| serde_json::from_str::<Vec<i64>>(s).unwrap_or_default())
        .unwrap_or_default();

    Ok(Some(AnnotationRecord {
        origin,
        game_id,
        game_name: row.get(1)?,
        state: row.get::<_, Option<String>>(2)?.filter(|s| !s.trim().is_empty()),
        trigger_value: row.get(3)?,
        recommended_values,
        wins: row.get::<_, i64>(5)?.max(0) as u32,
        losses: row.get::<_, i64>(6)?.max(0) as u32,
        display_text: row.get(7)?,
        recorded_at,
    }))
}
