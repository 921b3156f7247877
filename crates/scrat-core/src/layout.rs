//! On-destination layout:
//!
//! ```text
//! <root>/scrat-backup/
//! ├── metadata.db.enc
//! ├── recovery_info.txt
//! └── backups/
//!     └── <backup_id>/
//!         ├── manifest.json.enc
//!         ├── data.001.scrat
//!         └── ...
//! ```

use crate::archive::segment_name;

pub const REMOTE_ROOT: &str = "scrat-backup";
pub const BACKUPS_PREFIX: &str = "scrat-backup/backups";
pub const RECOVERY_INFO_PATH: &str = "scrat-backup/recovery_info.txt";
pub const CATALOG_COPY_PATH: &str = "scrat-backup/metadata.db.enc";

pub fn backup_dir(backup_id: &str) -> String {
    format!("{BACKUPS_PREFIX}/{backup_id}")
}

pub fn segment_path(backup_id: &str, ordinal: u32) -> String {
    format!("{}/{}", backup_dir(backup_id), segment_name(ordinal))
}

pub fn manifest_path(backup_id: &str) -> String {
    format!("{}/manifest.json.enc", backup_dir(backup_id))
}
