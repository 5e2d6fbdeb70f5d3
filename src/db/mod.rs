pub mod jobs;
pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// How long a connection waits on a locked database before giving up.
/// Workers each hold their own connection, so writers contend on the file lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode so the CLI can read while workers write
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.busy_timeout(BUSY_TIMEOUT)?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }

        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }
        if version < 3 {
            self.migrate_v3()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: tracks, analysis results, stems and their events
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tracks (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                title           TEXT,
                source_kind     TEXT NOT NULL CHECK (source_kind IN ('upload', 'external_fetch')),
                source_uri      TEXT NOT NULL,
                storage_path    TEXT NOT NULL,
                sample_rate     INTEGER,
                duration_ms     INTEGER,
                status          TEXT NOT NULL DEFAULT 'pending'
                                CHECK (status IN ('pending', 'queued', 'processing', 'done', 'failed')),
                created_at      TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_tracks_status ON tracks(status);

            CREATE TABLE IF NOT EXISTS analysis_results (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                track_id        INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                bpm             REAL NOT NULL,
                confidence      REAL NOT NULL,
                phase_shift_ms  INTEGER NOT NULL DEFAULT 0,
                measures        INTEGER NOT NULL,
                beat_count      INTEGER NOT NULL,
                onset_count     INTEGER NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_analysis_track ON analysis_results(track_id);

            CREATE TABLE IF NOT EXISTS stems (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                track_id        INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                analysis_id     INTEGER NOT NULL REFERENCES analysis_results(id) ON DELETE CASCADE,
                stem_type       TEXT NOT NULL CHECK (stem_type IN ('drums', 'bass', 'vocals', 'other')),
                storage_path    TEXT NOT NULL,
                peak_preview    BLOB NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(analysis_id, stem_type)
            );

            CREATE INDEX IF NOT EXISTS idx_stems_track ON stems(track_id);

            CREATE TABLE IF NOT EXISTS stem_events (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                stem_id         INTEGER NOT NULL REFERENCES stems(id) ON DELETE CASCADE,
                ts_ms           INTEGER NOT NULL,
                onset_ms        INTEGER NOT NULL,
                strength        REAL NOT NULL,
                kind            TEXT NOT NULL DEFAULT 'onset' CHECK (kind IN ('onset', 'accent')),
                count_in_8      INTEGER NOT NULL,
                measure_index   INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_stem ON stem_events(stem_id, ts_ms);
            ",
        )?;
        Ok(())
    }

    /// V2: job table for the dispatch boundary
    fn migrate_v2(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                track_id        INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                attempt         INTEGER NOT NULL DEFAULT 1,
                status          TEXT NOT NULL DEFAULT 'queued'
                                CHECK (status IN ('queued', 'running', 'succeeded', 'failed', 'timed_out')),
                worker          TEXT,
                error           TEXT,
                enqueued_at     INTEGER NOT NULL,
                started_at      INTEGER,
                deadline_at     INTEGER,
                finished_at     INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, id);
            CREATE INDEX IF NOT EXISTS idx_jobs_track ON jobs(track_id);
            ",
        )?;
        Ok(())
    }

    /// V3: job leases. `heartbeat_at` is refreshed while a run executes;
    /// `released_at` is set once the run has stopped and its retry is decided.
    fn migrate_v3(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            ALTER TABLE jobs ADD COLUMN heartbeat_at INTEGER;
            ALTER TABLE jobs ADD COLUMN released_at INTEGER;

            UPDATE jobs SET heartbeat_at = started_at WHERE started_at IS NOT NULL;
            UPDATE jobs SET released_at = finished_at WHERE status IN ('succeeded', 'failed');

            CREATE INDEX IF NOT EXISTS idx_jobs_live ON jobs(track_id) WHERE released_at IS NULL;
            ",
        )?;
        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 3;
