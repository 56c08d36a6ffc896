//! Event Store (K): the durable relational store behind the external-
//! collaborator schema in §6 (`events`, `system_control`, `logs`).
//!
//! Grounded in the schema given verbatim by `spec.md` §6; realized with
//! `rusqlite` in WAL journal mode, matching "reader/writer concurrency
//! requires a journal mode that does not block readers on writers."
//!
//! A single connection lives behind a mutex rather than a pool (see
//! DESIGN.md open-question 4): WAL already gives non-blocking
//! readers-vs-one-writer concurrency at the SQLite level, and this daemon's
//! callers (E, F, G, L) are few enough that pooling would add a dependency
//! for no real benefit.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::{Error, Result};
use crate::logger::{LogLevel, LogRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

pub struct EventStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub motion_score: i64,
    pub image_a_path: Option<String>,
    pub image_b_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub video_path: Option<String>,
    pub duration_seconds: i64,
}

impl EventStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                motion_score INTEGER NOT NULL,
                image_a_path TEXT,
                image_b_path TEXT,
                thumbnail_path TEXT,
                video_path TEXT,
                duration_seconds INTEGER NOT NULL DEFAULT 30,
                ai_label TEXT,
                ai_confidence REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS system_control (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                streaming INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL
            );
            INSERT OR IGNORE INTO system_control (id, streaming, updated_at)
                VALUES (1, 0, datetime('now'));",
        )?;
        Ok(EventStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_event(
        &self,
        timestamp: DateTime<Utc>,
        motion_score: i64,
        image_a_path: &str,
    ) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (timestamp, motion_score, image_a_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'), datetime('now'))",
            params![timestamp.to_rfc3339(), motion_score, image_a_path],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    pub fn save_picture_b(&self, event_id: u64, path: &str) -> Result<()> {
        self.update_field(event_id, "image_b_path", path)
    }

    pub fn save_thumbnail(&self, event_id: u64, path: &str) -> Result<()> {
        self.update_field(event_id, "thumbnail_path", path)
    }

    pub fn save_video(&self, event_id: u64, path: &str, duration_seconds: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE events SET video_path = ?1, duration_seconds = ?2, updated_at = datetime('now')
             WHERE id = ?3",
            params![path, duration_seconds, event_id],
        )?;
        Ok(())
    }

    fn update_field(&self, event_id: u64, column: &str, value: &str) -> Result<()> {
        // `column` is always one of our own hardcoded constants above, never
        // caller-supplied, so building the statement text is safe.
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "UPDATE events SET {column} = ?1, updated_at = datetime('now') WHERE id = ?2"
            ),
            params![value, event_id],
        )?;
        Ok(())
    }

    pub fn get_event(&self, event_id: u64) -> Result<Option<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, motion_score, image_a_path, image_b_path, thumbnail_path,
                    video_path, duration_seconds
             FROM events WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![event_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let timestamp_str: String = row.get(1)?;
        Ok(Some(EventRecord {
            id: row.get::<_, i64>(0)? as u64,
            timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            motion_score: row.get(2)?,
            image_a_path: row.get(3)?,
            image_b_path: row.get(4)?,
            thumbnail_path: row.get(5)?,
            video_path: row.get(6)?,
            duration_seconds: row.get(7)?,
        }))
    }

    pub fn get_streaming_flag(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let value: i64 = conn.query_row(
            "SELECT streaming FROM system_control WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(value != 0)
    }

    pub fn set_streaming_flag(&self, on: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE system_control SET streaming = ?1, updated_at = datetime('now') WHERE id = 1",
            params![on as i64],
        )?;
        Ok(())
    }

    pub fn add_log_batch(&self, batch: &[LogRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for record in batch {
            tx.execute(
                "INSERT INTO logs (timestamp, level, message) VALUES (?1, ?2, ?3)",
                params![
                    record.timestamp.to_rfc3339(),
                    level_str(record.level),
                    record.message
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "INFO",
        LogLevel::Warning => "WARNING",
        LogLevel::Error => "ERROR",
    }
}

/// Calls a fallible store operation and, on `DbUnavailable`, logs and
/// returns the caller-supplied sentinel instead of propagating - per §7,
/// "each call logs and returns a sentinel (0 or false); system continues."
pub fn or_sentinel<T: Clone>(result: Result<T>, sentinel: T, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(Error::DbUnavailable(e)) => {
            log::error!("event store unavailable ({context}): {e}");
            sentinel
        }
        Err(e) => {
            log::error!("unexpected error in event store call ({context}): {e}");
            sentinel
        }
    }
}
