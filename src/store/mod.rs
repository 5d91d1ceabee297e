//! Local State Store: an embedded SQLite database holding the two tables that make this agent
//! safe to restart — `processed_calls` (the Per-Call Shipping State, the system's sole durable
//! retry queue) and `recording_metadata` (the Recording Tracker's Descriptors). A single
//! mutex-guarded connection is shared across the process; SQLite itself serializes writers, and
//! the mutex just keeps two tasks from interleaving a read-modify-write.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::StoreConfig;
use crate::model::{RecordingDescriptor, ShippingState};
use crate::{Error, Result};

const SCHEMA_VERSION: i32 = 1;

pub struct Store {
    conn: Mutex<Connection>,
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current_version != 0 && current_version != SCHEMA_VERSION {
        warn!(found = current_version, expected = SCHEMA_VERSION, "local store schema version mismatch, recreating tables");
        conn.execute_batch("DROP TABLE IF EXISTS processed_calls; DROP TABLE IF EXISTS recording_metadata;")?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS processed_calls (
            linkedid TEXT PRIMARY KEY,
            first_seen TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            is_complete INTEGER NOT NULL,
            last_cdr_count INTEGER NOT NULL,
            last_cel_count INTEGER NOT NULL,
            shipped_at TEXT,
            ship_count INTEGER NOT NULL,
            error_count INTEGER NOT NULL,
            last_error TEXT
        );

        CREATE TABLE IF NOT EXISTS recording_metadata (
            filename TEXT PRIMARY KEY,
            channel TEXT,
            uniqueid TEXT,
            linkedid TEXT,
            callerid_num TEXT,
            exten TEXT,
            context TEXT,
            started_at TEXT NOT NULL,
            stopped_at TEXT,
            file_path TEXT,
            file_exists INTEGER NOT NULL,
            file_size INTEGER NOT NULL,
            last_size_check TEXT,
            size_stable_count INTEGER NOT NULL,
            recording_complete INTEGER NOT NULL,
            uploaded INTEGER NOT NULL,
            upload_status INTEGER,
            upload_attempts INTEGER NOT NULL,
            last_upload_attempt TEXT,
            last_upload_error TEXT,
            earliest_upload_time TEXT,
            synthetic_filename INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_processed_calls_error ON processed_calls(error_count);
        CREATE INDEX IF NOT EXISTS idx_recording_metadata_linkedid ON recording_metadata(linkedid);
        "#,
    )?;
    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
    Ok(())
}

fn open_at(path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    init_schema(&conn)?;
    Ok(conn)
}

impl Store {
    /// Opens the primary path, falling back to the fallback path (and finally an in-memory
    /// database) if the primary location is not writable.
    pub async fn open(config: &StoreConfig) -> Self {
        let primary = PathBuf::from(&config.primary_path);
        match open_at(&primary) {
            Ok(conn) => {
                info!(path = %primary.display(), "local state store opened");
                return Self { conn: Mutex::new(conn) };
            }
            Err(e) => warn!(path = %primary.display(), error = %e, "primary store path unavailable, falling back"),
        }

        let fallback = PathBuf::from(&config.fallback_path);
        match open_at(&fallback) {
            Ok(conn) => {
                warn!(path = %fallback.display(), "local state store opened at fallback path");
                Self { conn: Mutex::new(conn) }
            }
            Err(e) => {
                error!(error = %e, "fallback store path also unavailable, running with an in-memory store");
                let conn = Connection::open_in_memory().expect("in-memory sqlite connection");
                init_schema(&conn).expect("in-memory schema init");
                Self { conn: Mutex::new(conn) }
            }
        }
    }

    #[cfg(test)]
    pub async fn open_in_memory_for_test() -> Self {
        let conn = Connection::open_in_memory().expect("in-memory sqlite connection");
        init_schema(&conn).expect("in-memory schema init");
        Self { conn: Mutex::new(conn) }
    }

    pub async fn load_shipping_state(&self, linkedid: &str) -> Result<Option<ShippingState>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT linkedid, first_seen, last_updated, is_complete, last_cdr_count, last_cel_count, shipped_at, ship_count, error_count, last_error
             FROM processed_calls WHERE linkedid = ?1",
            params![linkedid],
            row_to_shipping_state,
        )
        .optional()
        .map_err(Error::Store)
    }

    pub async fn save_shipping_state(&self, state: &ShippingState) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO processed_calls (linkedid, first_seen, last_updated, is_complete, last_cdr_count, last_cel_count, shipped_at, ship_count, error_count, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(linkedid) DO UPDATE SET
                last_updated = excluded.last_updated,
                is_complete = excluded.is_complete,
                last_cdr_count = excluded.last_cdr_count,
                last_cel_count = excluded.last_cel_count,
                shipped_at = excluded.shipped_at,
                ship_count = excluded.ship_count,
                error_count = excluded.error_count,
                last_error = excluded.last_error",
            params![
                state.linkedid,
                state.first_seen.to_rfc3339(),
                state.last_updated.to_rfc3339(),
                state.is_complete as i64,
                state.last_cdr_count,
                state.last_cel_count,
                state.shipped_at.map(|t| t.to_rfc3339()),
                state.ship_count,
                state.error_count,
                state.last_error,
            ],
        )
        .map_err(Error::Store)?;
        Ok(())
    }

    pub async fn calls_with_errors(&self) -> Result<Vec<ShippingState>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT linkedid, first_seen, last_updated, is_complete, last_cdr_count, last_cel_count, shipped_at, ship_count, error_count, last_error
                 FROM processed_calls WHERE error_count > 0",
            )
            .map_err(Error::Store)?;
        let rows = stmt
            .query_map([], row_to_shipping_state)
            .map_err(Error::Store)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::Store)?;
        Ok(rows)
    }

    pub async fn purge_expired_calls(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().await;
        let cutoff = (now - chrono::Duration::hours(48)).to_rfc3339();
        let n = conn
            .execute(
                "DELETE FROM processed_calls WHERE shipped_at IS NOT NULL AND last_updated < ?1",
                params![cutoff],
            )
            .map_err(Error::Store)?;
        Ok(n as u64)
    }

    pub async fn load_recording(&self, filename: &str) -> Result<Option<RecordingDescriptor>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT filename, channel, uniqueid, linkedid, callerid_num, exten, context, started_at, stopped_at,
                    file_path, file_exists, file_size, last_size_check, size_stable_count, recording_complete,
                    uploaded, upload_status, upload_attempts, last_upload_attempt, last_upload_error,
                    earliest_upload_time, synthetic_filename
             FROM recording_metadata WHERE filename = ?1",
            params![filename],
            row_to_recording,
        )
        .optional()
        .map_err(Error::Store)
    }

    pub async fn save_recording(&self, r: &RecordingDescriptor) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO recording_metadata (filename, channel, uniqueid, linkedid, callerid_num, exten, context,
                started_at, stopped_at, file_path, file_exists, file_size, last_size_check, size_stable_count,
                recording_complete, uploaded, upload_status, upload_attempts, last_upload_attempt, last_upload_error,
                earliest_upload_time, synthetic_filename)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)
             ON CONFLICT(filename) DO UPDATE SET
                channel = excluded.channel, uniqueid = excluded.uniqueid, linkedid = excluded.linkedid,
                callerid_num = excluded.callerid_num, exten = excluded.exten, context = excluded.context,
                stopped_at = excluded.stopped_at, file_path = excluded.file_path, file_exists = excluded.file_exists,
                file_size = excluded.file_size, last_size_check = excluded.last_size_check,
                size_stable_count = excluded.size_stable_count, recording_complete = excluded.recording_complete,
                uploaded = excluded.uploaded, upload_status = excluded.upload_status,
                upload_attempts = excluded.upload_attempts, last_upload_attempt = excluded.last_upload_attempt,
                last_upload_error = excluded.last_upload_error, earliest_upload_time = excluded.earliest_upload_time,
                synthetic_filename = excluded.synthetic_filename",
            params![
                r.filename,
                r.channel,
                r.uniqueid,
                r.linkedid,
                r.callerid_num,
                r.exten,
                r.context,
                r.started_at.to_rfc3339(),
                r.stopped_at.map(|t| t.to_rfc3339()),
                r.file_path,
                r.file_exists as i64,
                r.file_size,
                r.last_size_check.map(|t| t.to_rfc3339()),
                r.size_stable_count,
                r.recording_complete as i64,
                r.uploaded as i64,
                r.upload_status,
                r.upload_attempts,
                r.last_upload_attempt.map(|t| t.to_rfc3339()),
                r.last_upload_error,
                r.earliest_upload_time.map(|t| t.to_rfc3339()),
                r.synthetic_filename as i64,
            ],
        )
        .map_err(Error::Store)?;
        Ok(())
    }

    pub async fn recordings_by_linkedid(&self, linkedid: &str) -> Result<Vec<RecordingDescriptor>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT filename, channel, uniqueid, linkedid, callerid_num, exten, context, started_at, stopped_at,
                        file_path, file_exists, file_size, last_size_check, size_stable_count, recording_complete,
                        uploaded, upload_status, upload_attempts, last_upload_attempt, last_upload_error,
                        earliest_upload_time, synthetic_filename
                 FROM recording_metadata WHERE linkedid = ?1",
            )
            .map_err(Error::Store)?;
        let rows = stmt
            .query_map(params![linkedid], row_to_recording)
            .map_err(Error::Store)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::Store)?;
        Ok(rows)
    }

    pub async fn pending_recordings(&self) -> Result<Vec<RecordingDescriptor>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT filename, channel, uniqueid, linkedid, callerid_num, exten, context, started_at, stopped_at,
                        file_path, file_exists, file_size, last_size_check, size_stable_count, recording_complete,
                        uploaded, upload_status, upload_attempts, last_upload_attempt, last_upload_error,
                        earliest_upload_time, synthetic_filename
                 FROM recording_metadata WHERE file_exists = 1 AND recording_complete = 0 AND uploaded = 0",
            )
            .map_err(Error::Store)?;
        let rows = stmt
            .query_map([], row_to_recording)
            .map_err(Error::Store)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::Store)?;
        Ok(rows)
    }

    pub async fn upload_eligible_recordings(&self, now: DateTime<Utc>) -> Result<Vec<RecordingDescriptor>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT filename, channel, uniqueid, linkedid, callerid_num, exten, context, started_at, stopped_at,
                        file_path, file_exists, file_size, last_size_check, size_stable_count, recording_complete,
                        uploaded, upload_status, upload_attempts, last_upload_attempt, last_upload_error,
                        earliest_upload_time, synthetic_filename
                 FROM recording_metadata
                 WHERE recording_complete = 1 AND uploaded = 0 AND earliest_upload_time IS NOT NULL AND earliest_upload_time <= ?1",
            )
            .map_err(Error::Store)?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], row_to_recording)
            .map_err(Error::Store)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::Store)?;
        Ok(rows)
    }

    pub async fn purge_expired_recordings(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().await;
        let cutoff = (now - chrono::Duration::hours(RecordingDescriptor::PURGE_AGE_HOURS)).to_rfc3339();
        let n = conn
            .execute("DELETE FROM recording_metadata WHERE started_at < ?1", params![cutoff])
            .map_err(Error::Store)?;
        Ok(n as u64)
    }
}

fn row_to_shipping_state(row: &rusqlite::Row) -> rusqlite::Result<ShippingState> {
    let shipped_at: Option<String> = row.get(6)?;
    Ok(ShippingState {
        linkedid: row.get(0)?,
        first_seen: parse_ts(row.get::<_, String>(1)?),
        last_updated: parse_ts(row.get::<_, String>(2)?),
        is_complete: row.get::<_, i64>(3)? != 0,
        last_cdr_count: row.get(4)?,
        last_cel_count: row.get(5)?,
        shipped_at: shipped_at.map(parse_ts),
        ship_count: row.get(7)?,
        error_count: row.get(8)?,
        last_error: row.get(9)?,
    })
}

fn row_to_recording(row: &rusqlite::Row) -> rusqlite::Result<RecordingDescriptor> {
    let stopped_at: Option<String> = row.get(8)?;
    let last_size_check: Option<String> = row.get(12)?;
    let last_upload_attempt: Option<String> = row.get(18)?;
    let earliest_upload_time: Option<String> = row.get(20)?;
    Ok(RecordingDescriptor {
        filename: row.get(0)?,
        channel: row.get(1)?,
        uniqueid: row.get(2)?,
        linkedid: row.get(3)?,
        callerid_num: row.get(4)?,
        exten: row.get(5)?,
        context: row.get(6)?,
        started_at: parse_ts(row.get::<_, String>(7)?),
        stopped_at: stopped_at.map(parse_ts),
        file_path: row.get(9)?,
        file_exists: row.get::<_, i64>(10)? != 0,
        file_size: row.get(11)?,
        last_size_check: last_size_check.map(parse_ts),
        size_stable_count: row.get(13)?,
        recording_complete: row.get::<_, i64>(14)? != 0,
        uploaded: row.get::<_, i64>(15)? != 0,
        upload_status: row.get(16)?,
        upload_attempts: row.get(17)?,
        last_upload_attempt: last_upload_attempt.map(parse_ts),
        last_upload_error: row.get(19)?,
        earliest_upload_time: earliest_upload_time.map(parse_ts),
        synthetic_filename: row.get::<_, i64>(21)? != 0,
    })
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory_store() -> Store {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        Store { conn: Mutex::new(conn) }
    }

    #[tokio::test]
    async fn round_trips_shipping_state() {
        let store = in_memory_store();
        let state = ShippingState::new("1.1", Utc::now());
        store.save_shipping_state(&state).await.unwrap();
        let loaded = store.load_shipping_state("1.1").await.unwrap().unwrap();
        assert_eq!(loaded.linkedid, "1.1");
        assert_eq!(loaded.error_count, 0);
    }

    #[tokio::test]
    async fn missing_linkedid_returns_none() {
        let store = in_memory_store();
        assert!(store.load_shipping_state("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn calls_with_errors_filters_by_error_count() {
        let store = in_memory_store();
        let mut ok = ShippingState::new("1.1", Utc::now());
        ok.error_count = 0;
        let mut failing = ShippingState::new("2.2", Utc::now());
        failing.error_count = 2;
        store.save_shipping_state(&ok).await.unwrap();
        store.save_shipping_state(&failing).await.unwrap();

        let errored = store.calls_with_errors().await.unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].linkedid, "2.2");
    }

    #[tokio::test]
    async fn round_trips_recording_descriptor() {
        let store = in_memory_store();
        let mut r = RecordingDescriptor::new("1700000000.1.wav", Utc::now());
        r.linkedid = Some("1.1".to_string());
        store.save_recording(&r).await.unwrap();
        let loaded = store.load_recording("1700000000.1.wav").await.unwrap().unwrap();
        assert_eq!(loaded.linkedid.as_deref(), Some("1.1"));
    }
}
