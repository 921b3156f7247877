use chrono::{DateTime, Utc};

use crate::error::{Result, ScratError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }

    /// Short form used in backup ids (`YYYYMMDD_HHMMSS_full` / `_incr`).
    pub fn id_suffix(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incr",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            other => Err(ScratError::Internal(format!("unknown backup kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Running,
    Completed,
    Failed,
    Partial,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Partial => "partial",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "running" => Ok(BackupStatus::Running),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            "partial" => Ok(BackupStatus::Partial),
            other => Err(ScratError::Internal(format!("unknown backup status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    Writing,
    Sealed,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveStatus::Writing => "writing",
            ArchiveStatus::Sealed => "sealed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "writing" => Ok(ArchiveStatus::Writing),
            "sealed" => Ok(ArchiveStatus::Sealed),
            other => Err(ScratError::Internal(format!("unknown archive status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFlag {
    Present,
    Deleted,
}

impl FileFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFlag::Present => "present",
            FileFlag::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "present" => Ok(FileFlag::Present),
            "deleted" => Ok(FileFlag::Deleted),
            other => Err(ScratError::Internal(format!("unknown file flag '{other}'"))),
        }
    }
}

/// One backup run as the catalog records it.
#[derive(Debug, Clone)]
pub struct BackupRow {
    pub backup_id: String,
    pub kind: BackupKind,
    pub base_backup_id: Option<String>,
    pub destination_ref: String,
    pub status: BackupStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files_total: u64,
    pub size_original: u64,
    pub size_stored: u64,
    pub salt: Vec<u8>,
    pub verifier: String,
    pub error_message: Option<String>,
}

impl BackupRow {
    pub fn salt_array(&self) -> Result<[u8; 32]> {
        self.salt
            .as_slice()
            .try_into()
            .map_err(|_| ScratError::Internal("backup salt is not 32 bytes".into()))
    }
}

/// One captured file within a backup.
#[derive(Debug, Clone)]
pub struct FileRow {
    pub backup_id: String,
    pub source_root: String,
    pub relative_path: String,
    pub logical_size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub archive_name: Option<String>,
    pub segment_offset: Option<u64>,
    pub segment_length: Option<u64>,
    pub flag: FileFlag,
}

/// One archive segment of a backup.
#[derive(Debug, Clone)]
pub struct ArchiveRow {
    pub backup_id: String,
    pub ordinal: u32,
    pub name: String,
    pub iv_seed: Vec<u8>,
    pub logical_size: u64,
    pub stored_size: u64,
    pub status: ArchiveStatus,
}

/// Aggregate totals reported for a completed run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackupStats {
    pub files_total: u64,
    pub size_original: u64,
    pub size_stored: u64,
}

/// Catalog-wide totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub total_backups: u64,
    pub completed_backups: u64,
    pub total_files: u64,
    pub size_original: u64,
    pub size_stored: u64,
}

/// One match from a cross-backup file search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub backup_id: String,
    pub backup_timestamp: DateTime<Utc>,
    pub source_root: String,
    pub relative_path: String,
    pub logical_size: u64,
    pub mtime: i64,
}
