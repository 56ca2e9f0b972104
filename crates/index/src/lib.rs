// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! TSRec Index - the durable recording index.
//!
//! One SQLite database per recording root, holding one row per segment.
//! Participants and waveform metadata are stored as JSON documents in-row and
//! filtered in memory; the indexed columns (`bot_id`, `start_utc`, `is_open`,
//! unique `file_id`) carry the queries.
//!
//! The connection lives behind its own mutex and is never touched while the
//! engine's recording mutex is held.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Timelike, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use tsrec_core::types::{Participant, RecordingInfo, WaveformInfo};
use tsrec_core::{RecError, Result};

/// Current schema version. Version 2 added the waveforms document; version 1
/// rows are upgraded in place with an empty document.
pub const SCHEMA_VERSION: i64 = 2;

/// Time-range and participant filter for [`RecordingIndex::list`].
#[derive(Debug, Default, Clone)]
pub struct ListFilter {
    pub from: Option<DateTime<Utc>>,
    /// A `to` that falls exactly on midnight is widened to the end of that
    /// day, so date-only arguments behave inclusively.
    pub to: Option<DateTime<Utc>>,
    /// Comma/semicolon-separated uid tokens; a row matches when some
    /// participant uid equals one of them (case-insensitive).
    pub uid: Option<String>,
    /// Comma/semicolon-separated name tokens; a row matches when some token
    /// is a substring of some participant name (case-insensitive).
    pub name: Option<String>,
}

/// Outcome of an API-level delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The row belongs to the currently open segment.
    RefusedOpen,
}

/// Durable store of recording rows.
pub struct RecordingIndex {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> RecError {
    RecError::Index(e.to_string())
}

fn split_tokens(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn matches_participants(row: &RecordingInfo, uid_tokens: &[String], name_tokens: &[String]) -> bool {
    let name_ok = name_tokens.is_empty()
        || row.participants.iter().any(|p| {
            let lowered = p.name.to_lowercase();
            name_tokens.iter().any(|t| lowered.contains(t.as_str()))
        });
    let uid_ok = uid_tokens.is_empty()
        || row
            .participants
            .iter()
            .any(|p| uid_tokens.iter().any(|t| p.uid.to_lowercase() == *t));
    name_ok && uid_ok
}

fn widen_to_end_of_day(to: DateTime<Utc>) -> DateTime<Utc> {
    if to.num_seconds_from_midnight() == 0 && to.timestamp_subsec_nanos() == 0 {
        to + chrono::Duration::days(1)
    } else {
        to
    }
}

impl RecordingIndex {
    /// Opens (or creates) the index database at `path` and migrates its
    /// schema to the current version.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// In-memory index, used by tests.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Inserts the row for a freshly opened segment.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on constraint violations (duplicate
    /// `file_id`) or other database errors.
    pub fn insert(&self, info: &RecordingInfo) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO recordings
               (bot_id, file_id, file_name, start_utc, end_utc, size_bytes, duration_ms,
                is_open, participants, waveforms, created_utc, updated_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                info.bot_id,
                info.file_id,
                info.file_name,
                info.start.timestamp(),
                info.end.map(|t| t.timestamp()),
                i64::try_from(info.size_bytes).unwrap_or(i64::MAX),
                info.duration_ms.map(|d| i64::try_from(d).unwrap_or(i64::MAX)),
                info.is_open,
                to_json(&info.participants)?,
                to_json(&info.waveforms)?,
                info.created.timestamp(),
                info.updated.timestamp(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Refreshes the live fields of an open segment's row.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn update_live(
        &self,
        bot_id: i64,
        file_id: &str,
        size_bytes: u64,
        duration_ms: u64,
        participants: &[Participant],
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE recordings
                SET size_bytes = ?1, duration_ms = ?2, participants = ?3, updated_utc = ?4
              WHERE bot_id = ?5 AND file_id = ?6",
            params![
                i64::try_from(size_bytes).unwrap_or(i64::MAX),
                i64::try_from(duration_ms).unwrap_or(i64::MAX),
                to_json(participants)?,
                Utc::now().timestamp(),
                bot_id,
                file_id,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Rewrites a row on finalization: the file id changes (the `__open`
    /// marker is renamed away), the end/duration/waveforms become final and
    /// the open flag clears.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn finalize_row(&self, old_file_id: &str, info: &RecordingInfo) -> Result<()> {
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE recordings
                    SET file_id = ?1, file_name = ?2, end_utc = ?3, size_bytes = ?4,
                        duration_ms = ?5, is_open = 0, participants = ?6, waveforms = ?7,
                        updated_utc = ?8
                  WHERE bot_id = ?9 AND file_id = ?10",
                params![
                    info.file_id,
                    info.file_name,
                    info.end.map(|t| t.timestamp()),
                    i64::try_from(info.size_bytes).unwrap_or(i64::MAX),
                    info.duration_ms.map(|d| i64::try_from(d).unwrap_or(i64::MAX)),
                    to_json(&info.participants)?,
                    to_json(&info.waveforms)?,
                    Utc::now().timestamp(),
                    info.bot_id,
                    old_file_id,
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            // Crash recovery finalizes files whose rows never made it in.
            self.insert(info)?;
        }
        Ok(())
    }

    /// Looks a row up by file id.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn get(&self, bot_id: i64, file_id: &str) -> Result<Option<RecordingInfo>> {
        let conn = self.lock();
        conn.query_row(
            &format!("{SELECT_ROW} WHERE bot_id = ?1 AND file_id = ?2"),
            params![bot_id, file_id],
            row_to_info,
        )
        .optional()
        .map_err(db_err)
    }

    /// Rows still flagged open, oldest first; consumed by crash recovery.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn open_rows(&self, bot_id: i64) -> Result<Vec<RecordingInfo>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_ROW} WHERE bot_id = ?1 AND is_open = 1 ORDER BY start_utc ASC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![bot_id], row_to_info)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Lists rows newest-start-first, applying the time range in SQL and the
    /// participant filter in memory.
    ///
    /// The caller substitutes its live view of the currently open segment.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn list(&self, bot_id: i64, filter: &ListFilter) -> Result<Vec<RecordingInfo>> {
        let from_ts = filter.from.map_or(i64::MIN, |t| t.timestamp());
        let to_ts = filter.to.map_or(i64::MAX, |t| widen_to_end_of_day(t).timestamp());
        let uid_tokens = filter.uid.as_deref().map(split_tokens).unwrap_or_default();
        let name_tokens = filter.name.as_deref().map(split_tokens).unwrap_or_default();

        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_ROW}
                  WHERE bot_id = ?1 AND start_utc >= ?2 AND start_utc <= ?3
                  ORDER BY start_utc DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![bot_id, from_ts, to_ts], row_to_info)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .filter(|r| matches_participants(r, &uid_tokens, &name_tokens))
            .collect())
    }

    /// Deduplicated union of all participants across the selected rows,
    /// alphabetized by name then uid, keeping the first non-empty display
    /// name seen per uid.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn list_participants(
        &self,
        bot_id: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Participant>> {
        let rows =
            self.list(bot_id, &ListFilter { from, to, uid: None, name: None })?;
        let mut by_uid: BTreeMap<String, String> = BTreeMap::new();
        for row in rows {
            for p in row.participants {
                let entry = by_uid.entry(p.uid).or_default();
                if entry.is_empty() && !p.name.is_empty() {
                    *entry = p.name;
                }
            }
        }
        let mut participants: Vec<Participant> =
            by_uid.into_iter().map(|(uid, name)| Participant { uid, name }).collect();
        participants.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.uid.cmp(&b.uid)));
        Ok(participants)
    }

    /// API-level delete: refuses rows that are still open.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn delete(&self, bot_id: i64, file_id: &str) -> Result<DeleteOutcome> {
        let Some(row) = self.get(bot_id, file_id)? else {
            return Ok(DeleteOutcome::NotFound);
        };
        if row.is_open {
            return Ok(DeleteOutcome::RefusedOpen);
        }
        self.remove_row(bot_id, file_id)?;
        Ok(DeleteOutcome::Deleted)
    }

    /// Unconditional row removal, used by finalize-discard and quota
    /// eviction.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn remove_row(&self, bot_id: i64, file_id: &str) -> Result<bool> {
        let conn = self.lock();
        let n = conn
            .execute(
                "DELETE FROM recordings WHERE bot_id = ?1 AND file_id = ?2",
                params![bot_id, file_id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    #[allow(clippy::unwrap_used)] // Mutex poisoning is a fatal error
    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

const SELECT_ROW: &str = "SELECT bot_id, file_id, file_name, start_utc, end_utc, size_bytes,
        duration_ms, is_open, participants, waveforms, created_utc, updated_utc
   FROM recordings";

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| RecError::Index(e.to_string()))
}

fn ts_to_utc(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

fn row_to_info(row: &Row<'_>) -> std::result::Result<RecordingInfo, rusqlite::Error> {
    let file_id: String = row.get(1)?;
    let participants_json: String = row.get(8)?;
    let waveforms_json: String = row.get(9)?;
    let participants: Vec<Participant> =
        serde_json::from_str(&participants_json).unwrap_or_default();
    let waveforms: Vec<WaveformInfo> = serde_json::from_str(&waveforms_json).unwrap_or_default();
    let size_bytes: i64 = row.get(5)?;
    let duration_ms: Option<i64> = row.get(6)?;

    Ok(RecordingInfo {
        id: RecordingInfo::id_from_file_id(&file_id),
        bot_id: row.get(0)?,
        file_id,
        file_name: row.get(2)?,
        start: ts_to_utc(row.get(3)?),
        end: row.get::<_, Option<i64>>(4)?.map(ts_to_utc),
        size_bytes: u64::try_from(size_bytes).unwrap_or(0),
        duration_ms: duration_ms.and_then(|d| u64::try_from(d).ok()),
        is_open: row.get(7)?,
        participants,
        waveforms,
        created: ts_to_utc(row.get(10)?),
        updated: ts_to_utc(row.get(11)?),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(db_err)?;

    if version == 0 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS recordings (
                 id INTEGER PRIMARY KEY,
                 bot_id INTEGER NOT NULL,
                 file_id TEXT NOT NULL UNIQUE,
                 file_name TEXT NOT NULL,
                 start_utc INTEGER NOT NULL,
                 end_utc INTEGER,
                 size_bytes INTEGER NOT NULL DEFAULT 0,
                 duration_ms INTEGER,
                 is_open INTEGER NOT NULL DEFAULT 0,
                 participants TEXT NOT NULL DEFAULT '[]',
                 waveforms TEXT NOT NULL DEFAULT '[]',
                 created_utc INTEGER NOT NULL,
                 updated_utc INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_recordings_bot ON recordings(bot_id);
             CREATE INDEX IF NOT EXISTS idx_recordings_start ON recordings(start_utc);
             CREATE INDEX IF NOT EXISTS idx_recordings_open ON recordings(is_open);",
        )
        .map_err(db_err)?;
    } else if version < SCHEMA_VERSION {
        tracing::info!(from = version, to = SCHEMA_VERSION, "upgrading recording index schema");
        // v1 -> v2: waveform sidecar metadata moved into the row.
        conn.execute_batch(
            "ALTER TABLE recordings ADD COLUMN waveforms TEXT NOT NULL DEFAULT '[]';",
        )
        .map_err(db_err)?;
    }

    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION).map_err(db_err)?;
    }
    Ok(())
}
