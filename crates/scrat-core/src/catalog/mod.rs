//! Local metadata catalog, the authoritative record of backups, files and
//! archives. One SQLite file; the engine process is the only writer.

mod types;

pub use types::{
    ArchiveRow, ArchiveStatus, BackupKind, BackupRow, BackupStats, BackupStatus, FileFlag,
    FileRow, SearchHit, Statistics,
};

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::config::{DestinationConfig, ScheduleConfig, SourceConfig};
use crate::error::Result;
use crate::scanner::{BaseFileMeta, FileRecord};

const SCHEMA_VERSION: u32 = 1;

/// Ring-buffer cap for the logs table.
const LOG_CAP: u64 = 10_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS backups (
    backup_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL CHECK(kind IN ('full', 'incremental')),
    base_backup_id TEXT REFERENCES backups(backup_id) ON DELETE SET NULL,
    destination_ref TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('running', 'completed', 'failed', 'partial')),
    started_at TEXT NOT NULL,
    finished_at TEXT,
    files_total INTEGER NOT NULL DEFAULT 0,
    size_original INTEGER NOT NULL DEFAULT 0,
    size_stored INTEGER NOT NULL DEFAULT 0,
    salt BLOB NOT NULL,
    verifier TEXT NOT NULL,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS backup_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backup_id TEXT NOT NULL REFERENCES backups(backup_id) ON DELETE CASCADE,
    source_root TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    logical_size INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    mode INTEGER NOT NULL DEFAULT 0,
    archive_name TEXT,
    segment_offset INTEGER,
    segment_length INTEGER,
    flag TEXT NOT NULL CHECK(flag IN ('present', 'deleted')),
    UNIQUE(backup_id, source_root, relative_path)
);

CREATE TABLE IF NOT EXISTS archives (
    backup_id TEXT NOT NULL REFERENCES backups(backup_id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    name TEXT NOT NULL,
    iv_seed BLOB NOT NULL,
    logical_size INTEGER NOT NULL DEFAULT 0,
    stored_size INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL CHECK(status IN ('writing', 'sealed')),
    PRIMARY KEY (backup_id, ordinal)
);

CREATE TABLE IF NOT EXISTS sources (
    name TEXT PRIMARY KEY,
    root_path TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    exclude_patterns TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS destinations (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    config TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_connected TEXT
);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 1,
    frequency TEXT NOT NULL
        CHECK(frequency IN ('daily', 'weekly', 'monthly', 'startup', 'shutdown')),
    config TEXT NOT NULL,
    last_run TEXT,
    next_run TEXT
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    backup_id TEXT
);

CREATE TABLE IF NOT EXISTS schema_info (
    version INTEGER PRIMARY KEY
);

CREATE INDEX IF NOT EXISTS idx_backup_files_backup_id
    ON backup_files(backup_id);
CREATE INDEX IF NOT EXISTS idx_backup_files_path
    ON backup_files(source_root, relative_path);
CREATE INDEX IF NOT EXISTS idx_backups_started_at
    ON backups(started_at DESC);
";

pub struct Catalog {
    conn: Connection,
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn json_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_backup(row: &rusqlite::Row) -> rusqlite::Result<BackupRow> {
    let kind_s: String = row.get(1)?;
    let status_s: String = row.get(4)?;
    let started_s: String = row.get(5)?;
    let finished_s: Option<String> = row.get(6)?;
    Ok(BackupRow {
        backup_id: row.get(0)?,
        kind: BackupKind::parse(&kind_s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e)))?,
        base_backup_id: row.get(2)?,
        destination_ref: row.get(3)?,
        status: BackupStatus::parse(&status_s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?,
        started_at: parse_ts(&started_s)?,
        finished_at: finished_s.as_deref().map(parse_ts).transpose()?,
        files_total: row.get::<_, i64>(7)? as u64,
        size_original: row.get::<_, i64>(8)? as u64,
        size_stored: row.get::<_, i64>(9)? as u64,
        salt: row.get(10)?,
        verifier: row.get(11)?,
        error_message: row.get(12)?,
    })
}

const BACKUP_COLS: &str = "backup_id, kind, base_backup_id, destination_ref, status, started_at, \
                           finished_at, files_total, size_original, size_stored, salt, verifier, \
                           error_message";

fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<FileRow> {
    let flag_s: String = row.get(9)?;
    Ok(FileRow {
        backup_id: row.get(0)?,
        source_root: row.get(1)?,
        relative_path: row.get(2)?,
        logical_size: row.get::<_, i64>(3)? as u64,
        mtime: row.get(4)?,
        mode: row.get::<_, i64>(5)? as u32,
        archive_name: row.get(6)?,
        segment_offset: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        segment_length: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        flag: FileFlag::parse(&flag_s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e)))?,
    })
}

const FILE_COLS: &str = "backup_id, source_root, relative_path, logical_size, mtime, mode, \
                         archive_name, segment_offset, segment_length, flag";

fn row_to_archive(row: &rusqlite::Row) -> rusqlite::Result<ArchiveRow> {
    let status_s: String = row.get(6)?;
    Ok(ArchiveRow {
        backup_id: row.get(0)?,
        ordinal: row.get::<_, i64>(1)? as u32,
        name: row.get(2)?,
        iv_seed: row.get(3)?,
        logical_size: row.get::<_, i64>(4)? as u64,
        stored_size: row.get::<_, i64>(5)? as u64,
        status: ArchiveStatus::parse(&status_s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?,
    })
}

const ARCHIVE_COLS: &str = "backup_id, ordinal, name, iv_seed, logical_size, stored_size, status";

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let catalog = Self { conn };
        catalog.init()?;
        info!(path = %path.display(), "catalog opened");
        Ok(catalog)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let catalog = Self { conn };
        catalog.init()?;
        Ok(catalog)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute("PRAGMA foreign_keys = ON", [])?;
        self.conn.execute_batch(SCHEMA)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_info (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    /// Path of the underlying database file, if file-backed.
    pub fn db_path(&self) -> Option<std::path::PathBuf> {
        self.conn.path().map(std::path::PathBuf::from)
    }

    // -----------------------------------------------------------------
    // Backups
    // -----------------------------------------------------------------

    /// Allocate a unique, monotonically increasing backup id for the
    /// destination. Seconds are bumped forward on collision so ids keep
    /// their lexicographic = chronological property; the returned timestamp
    /// is the (possibly adjusted) instant the id encodes, which the backup
    /// row must store as `started_at`.
    pub fn allocate_backup_id(
        &self,
        kind: BackupKind,
        destination_ref: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>)> {
        let newest: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(backup_id) FROM backups WHERE destination_ref = ?1",
                params![destination_ref],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let mut candidate_time = started_at;
        loop {
            let id = format!(
                "{}_{}",
                candidate_time
                    .with_timezone(&chrono::Local)
                    .format("%Y%m%d_%H%M%S"),
                kind.id_suffix()
            );

            let exists: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM backups WHERE backup_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            let stamp = id.rsplit_once('_').map(|(s, _)| s.to_string()).unwrap_or_default();
            let newest_stamp = newest
                .as_deref()
                .and_then(|n| n.rsplit_once('_'))
                .map(|(s, _)| s.to_string())
                .unwrap_or_default();

            if exists.is_none() && stamp > newest_stamp {
                return Ok((id, candidate_time));
            }
            candidate_time = candidate_time + Duration::seconds(1);
        }
    }

    pub fn create_backup(&self, backup: &BackupRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO backups (backup_id, kind, base_backup_id, destination_ref, status, \
             started_at, salt, verifier) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                backup.backup_id,
                backup.kind.as_str(),
                backup.base_backup_id,
                backup.destination_ref,
                backup.status.as_str(),
                ts(&backup.started_at),
                backup.salt,
                backup.verifier,
            ],
        )?;
        Ok(())
    }

    pub fn mark_backup_completed(
        &self,
        backup_id: &str,
        stats: &BackupStats,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE backups SET status = 'completed', finished_at = ?2, files_total = ?3, \
             size_original = ?4, size_stored = ?5 WHERE backup_id = ?1",
            params![
                backup_id,
                ts(&finished_at),
                stats.files_total as i64,
                stats.size_original as i64,
                stats.size_stored as i64,
            ],
        )?;
        Ok(())
    }

    pub fn mark_backup_failed(&self, backup_id: &str, reason: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE backups SET status = 'failed', finished_at = ?2, error_message = ?3 \
             WHERE backup_id = ?1",
            params![backup_id, ts(&Utc::now()), reason],
        )?;
        Ok(())
    }

    pub fn mark_backup_partial(&self, backup_id: &str, reason: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE backups SET status = 'partial', finished_at = ?2, error_message = ?3 \
             WHERE backup_id = ?1",
            params![backup_id, ts(&Utc::now()), reason],
        )?;
        Ok(())
    }

    pub fn backup(&self, backup_id: &str) -> Result<Option<BackupRow>> {
        let found = self
            .conn
            .query_row(
                &format!("SELECT {BACKUP_COLS} FROM backups WHERE backup_id = ?1"),
                params![backup_id],
                row_to_backup,
            )
            .optional()?;
        Ok(found)
    }

    pub fn latest_completed(&self, destination_ref: &str) -> Result<Option<BackupRow>> {
        let found = self
            .conn
            .query_row(
                &format!(
                    "SELECT {BACKUP_COLS} FROM backups \
                     WHERE destination_ref = ?1 AND status = 'completed' \
                     ORDER BY backup_id DESC LIMIT 1"
                ),
                params![destination_ref],
                row_to_backup,
            )
            .optional()?;
        Ok(found)
    }

    /// Completed backups for a destination, oldest first.
    pub fn completed_backups(&self, destination_ref: &str) -> Result<Vec<BackupRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BACKUP_COLS} FROM backups \
             WHERE destination_ref = ?1 AND status = 'completed' ORDER BY backup_id ASC"
        ))?;
        let rows = stmt.query_map(params![destination_ref], row_to_backup)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Backups left behind by a crashed or interrupted run.
    pub fn unfinished_backups(&self, destination_ref: &str) -> Result<Vec<BackupRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BACKUP_COLS} FROM backups \
             WHERE destination_ref = ?1 AND status IN ('running', 'partial') \
             ORDER BY backup_id ASC"
        ))?;
        let rows = stmt.query_map(params![destination_ref], row_to_backup)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Delete a backup with its files and archives (cascade).
    pub fn delete_backup(&self, backup_id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM backups WHERE backup_id = ?1", params![backup_id])?;
        Ok(n > 0)
    }

    // -----------------------------------------------------------------
    // Archives and files
    // -----------------------------------------------------------------

    /// Record a new segment in `writing` state. Only the highest ordinal of
    /// a backup may be in this state.
    pub fn open_archive(
        &self,
        backup_id: &str,
        ordinal: u32,
        name: &str,
        iv_seed: &[u8],
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO archives (backup_id, ordinal, name, iv_seed, status) \
             VALUES (?1, ?2, ?3, ?4, 'writing')",
            params![backup_id, ordinal as i64, name, iv_seed],
        )?;
        Ok(())
    }

    /// Seal a segment and commit its file placements in one transaction.
    /// The run does not start the next segment until this returns.
    pub fn seal_archive(
        &mut self,
        backup_id: &str,
        ordinal: u32,
        logical_size: u64,
        stored_size: u64,
        files: &[FileRow],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE archives SET status = 'sealed', logical_size = ?3, stored_size = ?4 \
             WHERE backup_id = ?1 AND ordinal = ?2",
            params![backup_id, ordinal as i64, logical_size as i64, stored_size as i64],
        )?;
        for file in files {
            tx.execute(
                "INSERT INTO backup_files (backup_id, source_root, relative_path, logical_size, \
                 mtime, mode, archive_name, segment_offset, segment_length, flag) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    file.backup_id,
                    file.source_root,
                    file.relative_path,
                    file.logical_size as i64,
                    file.mtime,
                    file.mode as i64,
                    file.archive_name,
                    file.segment_offset.map(|v| v as i64),
                    file.segment_length.map(|v| v as i64),
                    file.flag.as_str(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop the catalog row of a segment that was abandoned before sealing.
    pub fn discard_archive(&self, backup_id: &str, ordinal: u32) -> Result<()> {
        self.conn.execute(
            "DELETE FROM archives WHERE backup_id = ?1 AND ordinal = ?2 AND status = 'writing'",
            params![backup_id, ordinal as i64],
        )?;
        Ok(())
    }

    /// Remove a backup's file and archive rows while keeping the backup row
    /// itself. Used after the run's data was removed from the destination.
    pub fn clear_backup_contents(&mut self, backup_id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM backup_files WHERE backup_id = ?1",
            params![backup_id],
        )?;
        tx.execute("DELETE FROM archives WHERE backup_id = ?1", params![backup_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Write a consistent snapshot of the database to `to` using the SQLite
    /// online backup API. Safe while this connection stays open.
    pub fn export_snapshot(&self, to: &Path) -> Result<()> {
        let mut target = Connection::open(to)?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut target)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(5), None)?;
        Ok(())
    }

    /// Record deletions observed by the scanner. Deleted rows carry no
    /// archive placement.
    pub fn insert_deleted_files(&mut self, backup_id: &str, records: &[FileRecord]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for record in records {
            tx.execute(
                "INSERT INTO backup_files (backup_id, source_root, relative_path, logical_size, \
                 mtime, mode, flag) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'deleted')",
                params![
                    backup_id,
                    record.source_root,
                    record.relative_path,
                    record.size as i64,
                    record.mtime,
                    record.mode as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn archives_for_backup(&self, backup_id: &str) -> Result<Vec<ArchiveRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ARCHIVE_COLS} FROM archives WHERE backup_id = ?1 ORDER BY ordinal ASC"
        ))?;
        let rows = stmt.query_map(params![backup_id], row_to_archive)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn files_for_backup(&self, backup_id: &str) -> Result<Vec<FileRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FILE_COLS} FROM backup_files WHERE backup_id = ?1 ORDER BY relative_path ASC"
        ))?;
        let rows = stmt.query_map(params![backup_id], row_to_file)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Present files of one backup as a diff base fragment.
    pub fn present_file_meta(
        &self,
        backup_id: &str,
    ) -> Result<HashMap<(String, String), BaseFileMeta>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_root, relative_path, logical_size, mtime FROM backup_files \
             WHERE backup_id = ?1 AND flag = 'present'",
        )?;
        let rows = stmt.query_map(params![backup_id], |row| {
            Ok((
                (row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                BaseFileMeta {
                    size: row.get::<_, i64>(2)? as u64,
                    mtime: row.get(3)?,
                },
            ))
        })?;
        Ok(rows.collect::<std::result::Result<HashMap<_, _>, _>>()?)
    }

    // -----------------------------------------------------------------
    // Sources, destinations, schedules
    // -----------------------------------------------------------------

    pub fn upsert_source(&self, source: &SourceConfig) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sources (name, root_path, enabled, exclude_patterns) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(name) DO UPDATE SET root_path = ?2, enabled = ?3, exclude_patterns = ?4",
            params![
                source.name,
                source.root_path,
                source.enabled as i64,
                serde_json::to_string(&source.exclude_patterns)?,
            ],
        )?;
        Ok(())
    }

    pub fn remove_source(&self, name: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM sources WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    pub fn sources(&self) -> Result<Vec<SourceConfig>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, root_path, enabled, exclude_patterns FROM sources ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let patterns: String = row.get(3)?;
            Ok(SourceConfig {
                name: row.get(0)?,
                root_path: row.get(1)?,
                enabled: row.get::<_, i64>(2)? != 0,
                exclude_patterns: serde_json::from_str(&patterns).map_err(json_err)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn source(&self, name: &str) -> Result<Option<SourceConfig>> {
        Ok(self.sources()?.into_iter().find(|s| s.name == name))
    }

    pub fn upsert_destination(&self, destination: &DestinationConfig) -> Result<()> {
        self.conn.execute(
            "INSERT INTO destinations (id, kind, config, enabled) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET kind = ?2, config = ?3, enabled = ?4",
            params![
                destination.id,
                destination.kind.name(),
                serde_json::to_string(destination)?,
                destination.enabled as i64,
            ],
        )?;
        Ok(())
    }

    pub fn remove_destination(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM destinations WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn destinations(&self) -> Result<Vec<DestinationConfig>> {
        let mut stmt = self
            .conn
            .prepare("SELECT config FROM destinations ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            serde_json::from_str::<DestinationConfig>(&raw).map_err(json_err)
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn destination(&self, id: &str) -> Result<Option<DestinationConfig>> {
        let found = self
            .conn
            .query_row(
                "SELECT config FROM destinations WHERE id = ?1",
                params![id],
                |row| {
                    let raw: String = row.get(0)?;
                    serde_json::from_str::<DestinationConfig>(&raw).map_err(json_err)
                },
            )
            .optional()?;
        Ok(found)
    }

    pub fn touch_destination_connected(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE destinations SET last_connected = ?2 WHERE id = ?1",
            params![id, ts(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn install_schedule(&self, schedule: &ScheduleConfig) -> Result<()> {
        schedule.validate()?;
        self.conn.execute(
            "INSERT INTO schedules (id, enabled, frequency, config) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET enabled = ?2, frequency = ?3, config = ?4, \
             next_run = NULL",
            params![
                schedule.id,
                schedule.enabled as i64,
                schedule.frequency.as_str(),
                serde_json::to_string(schedule)?,
            ],
        )?;
        Ok(())
    }

    pub fn remove_schedule(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn schedules(&self) -> Result<Vec<ScheduleRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT config, last_run, next_run FROM schedules ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            let last_s: Option<String> = row.get(1)?;
            let next_s: Option<String> = row.get(2)?;
            Ok(ScheduleRow {
                config: serde_json::from_str(&raw).map_err(json_err)?,
                last_run: last_s.as_deref().map(parse_ts).transpose()?,
                next_run: next_s.as_deref().map(parse_ts).transpose()?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn schedule(&self, id: &str) -> Result<Option<ScheduleRow>> {
        Ok(self.schedules()?.into_iter().find(|s| s.config.id == id))
    }

    pub fn update_schedule_runs(
        &self,
        id: &str,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE schedules SET last_run = COALESCE(?2, last_run), next_run = ?3 WHERE id = ?1",
            params![id, last_run.as_ref().map(ts), next_run.as_ref().map(ts)],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Logs, statistics, search
    // -----------------------------------------------------------------

    pub fn log(&self, level: &str, message: &str, backup_id: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO logs (timestamp, level, message, backup_id) VALUES (?1, ?2, ?3, ?4)",
            params![ts(&Utc::now()), level, message, backup_id],
        )?;
        let id = self.conn.last_insert_rowid();
        if id % 1000 == 0 {
            self.conn.execute(
                "DELETE FROM logs WHERE id NOT IN (SELECT id FROM logs ORDER BY id DESC LIMIT ?1)",
                params![LOG_CAP as i64],
            )?;
        }
        Ok(())
    }

    pub fn statistics(&self) -> Result<Statistics> {
        let (total_backups, completed_backups): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'completed'), 0) FROM backups",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (size_original, size_stored): (i64, i64) = self.conn.query_row(
            "SELECT COALESCE(SUM(size_original), 0), COALESCE(SUM(size_stored), 0) \
             FROM backups WHERE status = 'completed'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let total_files: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM backup_files", [], |row| row.get(0))?;

        Ok(Statistics {
            total_backups: total_backups as u64,
            completed_backups: completed_backups as u64,
            total_files: total_files as u64,
            size_original: size_original as u64,
            size_stored: size_stored as u64,
        })
    }

    /// Search captured files by path substring across completed backups,
    /// newest backups first.
    pub fn search_files(&self, pattern: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let mut stmt = self.conn.prepare(
            "SELECT bf.backup_id, b.started_at, bf.source_root, bf.relative_path, \
             bf.logical_size, bf.mtime \
             FROM backup_files bf JOIN backups b ON bf.backup_id = b.backup_id \
             WHERE b.status = 'completed' AND bf.flag = 'present' \
             AND bf.relative_path LIKE ?1 ESCAPE '\\' \
             ORDER BY bf.backup_id DESC, bf.relative_path ASC LIMIT ?2",
        )?;
        let like = format!(
            "%{}%",
            pattern.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let rows = stmt.query_map(params![like, limit as i64], |row| {
            let started_s: String = row.get(1)?;
            Ok(SearchHit {
                backup_id: row.get(0)?,
                backup_timestamp: parse_ts(&started_s)?,
                source_root: row.get(2)?,
                relative_path: row.get(3)?,
                logical_size: row.get::<_, i64>(4)? as u64,
                mtime: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

/// An installed schedule with its run bookkeeping.
#[derive(Debug, Clone)]
pub struct ScheduleRow {
    pub config: ScheduleConfig,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_backup(id: &str, kind: BackupKind, base: Option<&str>) -> BackupRow {
        BackupRow {
            backup_id: id.to_string(),
            kind,
            base_backup_id: base.map(|s| s.to_string()),
            destination_ref: "dest1".into(),
            status: BackupStatus::Running,
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            finished_at: None,
            files_total: 0,
            size_original: 0,
            size_stored: 0,
            salt: vec![0u8; 32],
            verifier: "aa".into(),
            error_message: None,
        }
    }

    fn present_file(backup_id: &str, path: &str) -> FileRow {
        FileRow {
            backup_id: backup_id.into(),
            source_root: "docs".into(),
            relative_path: path.into(),
            logical_size: 10,
            mtime: 100,
            mode: 0o644,
            archive_name: Some("data.001.scrat".into()),
            segment_offset: Some(0),
            segment_length: Some(64),
            flag: FileFlag::Present,
        }
    }

    #[test]
    fn backup_lifecycle_roundtrip() {
        let catalog = Catalog::open_in_memory().unwrap();
        let backup = new_backup("20240501_120000_full", BackupKind::Full, None);
        catalog.create_backup(&backup).unwrap();

        let loaded = catalog.backup("20240501_120000_full").unwrap().unwrap();
        assert_eq!(loaded.status, BackupStatus::Running);
        assert_eq!(loaded.kind, BackupKind::Full);

        catalog
            .mark_backup_completed(
                "20240501_120000_full",
                &BackupStats {
                    files_total: 3,
                    size_original: 100,
                    size_stored: 60,
                },
                Utc::now(),
            )
            .unwrap();
        let loaded = catalog.backup("20240501_120000_full").unwrap().unwrap();
        assert_eq!(loaded.status, BackupStatus::Completed);
        assert_eq!(loaded.files_total, 3);
        assert!(loaded.finished_at.is_some());
    }

    #[test]
    fn allocate_backup_id_bumps_on_collision() {
        let catalog = Catalog::open_in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let (first, first_at) = catalog
            .allocate_backup_id(BackupKind::Full, "dest1", at)
            .unwrap();
        assert_eq!(first_at, at);
        let mut row = new_backup(&first, BackupKind::Full, None);
        row.backup_id = first.clone();
        catalog.create_backup(&row).unwrap();

        let (second, second_at) = catalog
            .allocate_backup_id(BackupKind::Incremental, "dest1", at)
            .unwrap();
        assert_ne!(first, second);
        assert!(second > first, "{second} should sort after {first}");
        assert!(second_at > first_at, "adjusted start time moves forward");
    }

    #[test]
    fn seal_archive_commits_files_atomically() {
        let mut catalog = Catalog::open_in_memory().unwrap();
        let backup = new_backup("20240501_120000_full", BackupKind::Full, None);
        catalog.create_backup(&backup).unwrap();
        catalog
            .open_archive("20240501_120000_full", 1, "data.001.scrat", &[1u8; 12])
            .unwrap();

        let files = vec![
            present_file("20240501_120000_full", "a.txt"),
            present_file("20240501_120000_full", "b/c.bin"),
        ];
        catalog
            .seal_archive("20240501_120000_full", 1, 128, 96, &files)
            .unwrap();

        let archives = catalog.archives_for_backup("20240501_120000_full").unwrap();
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].status, ArchiveStatus::Sealed);
        assert_eq!(archives[0].stored_size, 96);

        let files = catalog.files_for_backup("20240501_120000_full").unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn duplicate_file_in_one_backup_is_rejected() {
        let mut catalog = Catalog::open_in_memory().unwrap();
        let backup = new_backup("20240501_120000_full", BackupKind::Full, None);
        catalog.create_backup(&backup).unwrap();
        catalog
            .open_archive("20240501_120000_full", 1, "data.001.scrat", &[1u8; 12])
            .unwrap();

        let files = vec![
            present_file("20240501_120000_full", "a.txt"),
            present_file("20240501_120000_full", "a.txt"),
        ];
        assert!(catalog
            .seal_archive("20240501_120000_full", 1, 128, 96, &files)
            .is_err());

        // The failed transaction must not leave partial rows behind.
        assert!(catalog.files_for_backup("20240501_120000_full").unwrap().is_empty());
    }

    #[test]
    fn delete_backup_cascades() {
        let mut catalog = Catalog::open_in_memory().unwrap();
        let backup = new_backup("20240501_120000_full", BackupKind::Full, None);
        catalog.create_backup(&backup).unwrap();
        catalog
            .open_archive("20240501_120000_full", 1, "data.001.scrat", &[1u8; 12])
            .unwrap();
        catalog
            .seal_archive(
                "20240501_120000_full",
                1,
                10,
                10,
                &[present_file("20240501_120000_full", "a.txt")],
            )
            .unwrap();

        assert!(catalog.delete_backup("20240501_120000_full").unwrap());
        assert!(catalog.files_for_backup("20240501_120000_full").unwrap().is_empty());
        assert!(catalog.archives_for_backup("20240501_120000_full").unwrap().is_empty());
    }

    #[test]
    fn latest_completed_ignores_running_and_failed() {
        let catalog = Catalog::open_in_memory().unwrap();
        for (id, status) in [
            ("20240501_120000_full", BackupStatus::Completed),
            ("20240502_120000_incr", BackupStatus::Failed),
            ("20240503_120000_incr", BackupStatus::Running),
        ] {
            let mut backup = new_backup(id, BackupKind::Full, None);
            backup.status = BackupStatus::Running;
            catalog.create_backup(&backup).unwrap();
            match status {
                BackupStatus::Completed => catalog
                    .mark_backup_completed(id, &BackupStats::default(), Utc::now())
                    .unwrap(),
                BackupStatus::Failed => catalog.mark_backup_failed(id, "boom").unwrap(),
                _ => {}
            }
        }

        let latest = catalog.latest_completed("dest1").unwrap().unwrap();
        assert_eq!(latest.backup_id, "20240501_120000_full");

        let unfinished = catalog.unfinished_backups("dest1").unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].backup_id, "20240503_120000_incr");
    }

    #[test]
    fn source_and_destination_registry_roundtrip() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .upsert_source(&SourceConfig {
                name: "docs".into(),
                root_path: "/home/u/docs".into(),
                enabled: true,
                exclude_patterns: vec!["*.iso".into()],
            })
            .unwrap();
        catalog
            .upsert_destination(&DestinationConfig {
                id: "usb1".into(),
                kind: crate::config::DestinationKind::Local {
                    root_path: "/mnt/usb".into(),
                },
                enabled: true,
            })
            .unwrap();

        let sources = catalog.sources().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].exclude_patterns, vec!["*.iso".to_string()]);

        let dest = catalog.destination("usb1").unwrap().unwrap();
        assert_eq!(dest.kind.name(), "local");
    }

    #[test]
    fn schedule_runs_bookkeeping() {
        let catalog = Catalog::open_in_memory().unwrap();
        let schedule = ScheduleConfig {
            id: "nightly".into(),
            enabled: true,
            frequency: crate::config::Frequency::Daily,
            time_of_day: chrono::NaiveTime::from_hms_opt(2, 0, 0),
            weekdays: vec![],
            day_of_month: None,
            sources: vec!["docs".into()],
            destination_id: "usb1".into(),
        };
        catalog.install_schedule(&schedule).unwrap();

        let next = Utc.with_ymd_and_hms(2024, 5, 2, 2, 0, 0).unwrap();
        catalog
            .update_schedule_runs("nightly", None, Some(next))
            .unwrap();
        let row = catalog.schedule("nightly").unwrap().unwrap();
        assert_eq!(row.next_run, Some(next));
        assert_eq!(row.last_run, None);

        // Reinstalling resets next_run so the worker recomputes it.
        catalog.install_schedule(&schedule).unwrap();
        let row = catalog.schedule("nightly").unwrap().unwrap();
        assert_eq!(row.next_run, None);
    }

    #[test]
    fn search_escapes_like_metacharacters() {
        let mut catalog = Catalog::open_in_memory().unwrap();
        let backup = new_backup("20240501_120000_full", BackupKind::Full, None);
        catalog.create_backup(&backup).unwrap();
        catalog
            .open_archive("20240501_120000_full", 1, "data.001.scrat", &[1u8; 12])
            .unwrap();
        catalog
            .seal_archive(
                "20240501_120000_full",
                1,
                10,
                10,
                &[
                    present_file("20240501_120000_full", "report_2024.txt"),
                    present_file("20240501_120000_full", "reportX2024.txt"),
                ],
            )
            .unwrap();
        catalog
            .mark_backup_completed("20240501_120000_full", &BackupStats::default(), Utc::now())
            .unwrap();

        let hits = catalog.search_files("report_2024", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].relative_path, "report_2024.txt");
    }

    #[test]
    fn statistics_counts_completed_only() {
        let catalog = Catalog::open_in_memory().unwrap();
        let a = new_backup("20240501_120000_full", BackupKind::Full, None);
        catalog.create_backup(&a).unwrap();
        catalog
            .mark_backup_completed(
                "20240501_120000_full",
                &BackupStats {
                    files_total: 2,
                    size_original: 100,
                    size_stored: 80,
                },
                Utc::now(),
            )
            .unwrap();
        let b = new_backup("20240502_120000_full", BackupKind::Full, None);
        catalog.create_backup(&b).unwrap();
        catalog.mark_backup_failed("20240502_120000_full", "x").unwrap();

        let stats = catalog.statistics().unwrap();
        assert_eq!(stats.total_backups, 2);
        assert_eq!(stats.completed_backups, 1);
        assert_eq!(stats.size_original, 100);
    }
}
