use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::error::{Result, ScratError};

/// Top-level engine configuration.
///
/// The catalog database is authoritative for sources, destinations and
/// schedules; this file carries the backup policy and engine paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratConfig {
    /// Path to the catalog database file.
    pub catalog_path: String,
    #[serde(default)]
    pub policy: BackupPolicy,
    /// Spool directory for staged uploads. Defaults to the system temp dir.
    #[serde(default)]
    pub spool_dir: Option<String>,
}

impl ScratConfig {
    pub fn validate(&self) -> Result<()> {
        if self.catalog_path.trim().is_empty() {
            return Err(ScratError::Validation("catalog_path must not be empty".into()));
        }
        self.policy.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPolicy {
    /// Number of backup chains (full + dependent incrementals) to keep.
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
    /// Archive segment split threshold in stored bytes.
    #[serde(default = "default_split_size_bytes")]
    pub split_size_bytes: u64,
    /// AEAD chunk size for the segment envelope.
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u32,
    #[serde(default)]
    pub compression: CompressionSetting,
    /// Re-download and authenticate every sealed segment after a run.
    #[serde(default)]
    pub verify_after_backup: bool,
    /// Upload an encrypted copy of the catalog next to the backups.
    #[serde(default = "default_true")]
    pub upload_catalog_copy: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            max_versions: default_max_versions(),
            split_size_bytes: default_split_size_bytes(),
            chunk_size_bytes: default_chunk_size_bytes(),
            compression: CompressionSetting::default(),
            verify_after_backup: false,
            upload_catalog_copy: true,
            retry: RetryConfig::default(),
        }
    }
}

impl BackupPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_versions == 0 {
            return Err(ScratError::Validation("max_versions must be at least 1".into()));
        }
        if self.split_size_bytes == 0 {
            return Err(ScratError::Validation("split_size_bytes must be nonzero".into()));
        }
        if self.chunk_size_bytes == 0 {
            return Err(ScratError::Validation("chunk_size_bytes must be nonzero".into()));
        }
        Ok(())
    }
}

/// User-facing compression setting. `None` means store-only, on purpose —
/// turning compression off is a policy decision, never a runtime fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionSetting {
    None,
    #[default]
    Fast,
    Balanced,
    Best,
}

/// Retry settings for transient destination failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// A directory selected for backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub root_path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// A backup destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: DestinationKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationKind {
    /// Local directory, including mounted removable media.
    Local { root_path: String },
    /// SFTP server, password or private-key auth.
    Sftp {
        host: String,
        #[serde(default = "default_sftp_port")]
        port: u16,
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        key_path: Option<String>,
        root_path: String,
    },
    /// SMB/CIFS share addressed as `\\server\share`, reached through the
    /// OS filesystem layer (mounted on non-Windows hosts).
    Smb {
        server: String,
        share: String,
        #[serde(default)]
        domain: Option<String>,
        #[serde(default)]
        root_path: Option<String>,
        /// Mount point of the share on non-Windows hosts.
        #[serde(default)]
        mount_point: Option<String>,
    },
    /// WebDAV endpoint. HTTPS with certificate verification by default.
    Webdav {
        url: String,
        username: String,
        password: String,
        #[serde(default)]
        allow_insecure_http: bool,
    },
    /// Shell-out to a multi-cloud object mover (rclone-compatible surface).
    ShelledMultiCloud {
        #[serde(default = "default_shell_program")]
        program: String,
        /// Remote name as configured in the mover, e.g. "gdrive".
        remote: String,
        root_path: String,
    },
}

impl DestinationKind {
    pub fn name(&self) -> &'static str {
        match self {
            DestinationKind::Local { .. } => "local",
            DestinationKind::Sftp { .. } => "sftp",
            DestinationKind::Smb { .. } => "smb",
            DestinationKind::Webdav { .. } => "webdav",
            DestinationKind::ShelledMultiCloud { .. } => "shelled_multi_cloud",
        }
    }
}

/// Backup schedule. `last_run`/`next_run` live in the catalog; this is the
/// installable definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub frequency: Frequency,
    /// Local wall-clock time for daily/weekly/monthly schedules.
    #[serde(default)]
    pub time_of_day: Option<NaiveTime>,
    /// ISO weekday numbers (1 = Monday .. 7 = Sunday), weekly only.
    #[serde(default)]
    pub weekdays: Vec<u8>,
    /// Day of month (1-31), monthly only; clamped to the month's end.
    #[serde(default)]
    pub day_of_month: Option<u32>,
    /// Source names included in the run.
    pub sources: Vec<String>,
    pub destination_id: String,
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ScratError::Validation("schedule id must not be empty".into()));
        }
        match self.frequency {
            Frequency::Daily => {
                if self.time_of_day.is_none() {
                    return Err(ScratError::Validation(
                        "daily schedule requires time_of_day".into(),
                    ));
                }
            }
            Frequency::Weekly => {
                if self.time_of_day.is_none() || self.weekdays.is_empty() {
                    return Err(ScratError::Validation(
                        "weekly schedule requires time_of_day and weekdays".into(),
                    ));
                }
                if self.weekdays.iter().any(|d| !(1..=7).contains(d)) {
                    return Err(ScratError::Validation(
                        "weekdays must be ISO numbers 1-7".into(),
                    ));
                }
            }
            Frequency::Monthly => {
                let day = self.day_of_month.unwrap_or(0);
                if self.time_of_day.is_none() || !(1..=31).contains(&day) {
                    return Err(ScratError::Validation(
                        "monthly schedule requires time_of_day and day_of_month 1-31".into(),
                    ));
                }
            }
            Frequency::Startup | Frequency::Shutdown => {}
        }
        if self.sources.is_empty() {
            return Err(ScratError::Validation(
                "schedule must name at least one source".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Startup,
    Shutdown,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Startup => "startup",
            Frequency::Shutdown => "shutdown",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "startup" => Ok(Frequency::Startup),
            "shutdown" => Ok(Frequency::Shutdown),
            other => Err(ScratError::Validation(format!("unknown frequency '{other}'"))),
        }
    }

    /// Whether this frequency fires from wall-clock time (as opposed to an
    /// OS lifecycle hook).
    pub fn is_wall_clock(&self) -> bool {
        matches!(self, Frequency::Daily | Frequency::Weekly | Frequency::Monthly)
    }
}
