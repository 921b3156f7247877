use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::key::MasterKey;
use crate::crypto::stream;
use crate::error::Result;

pub const FORMAT_VERSION: u32 = 1;

/// Per-backup catalog excerpt written to the destination next to the
/// archives, sealed in the same envelope format as the segments. Carries
/// enough to recover the archive set without the local catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub backup_id: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub base_backup_id: Option<String>,
    pub format_version: u32,
    pub sources: Vec<ManifestSource>,
    pub archives: Vec<ManifestArchive>,
    pub stats: ManifestStats,
    pub verifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSource {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestArchive {
    pub ordinal: u32,
    pub name: String,
    pub stored_size: u64,
    /// Hex-encoded 96-bit nonce seed of the segment.
    pub iv_seed: String,
    pub files_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestStats {
    pub files_total: u64,
    pub size_original: u64,
    pub size_stored: u64,
    pub duration_seconds: u64,
}

/// Serialize and seal the manifest for upload.
pub fn seal(manifest: &Manifest, key: &MasterKey, salt: &[u8; 32]) -> Result<Vec<u8>> {
    let plaintext = serde_json::to_vec_pretty(manifest)?;
    stream::seal_bytes(key, salt, &plaintext)
}

/// Decrypt and parse a sealed manifest.
pub fn open(passphrase: &str, data: &[u8]) -> Result<Manifest> {
    let plaintext = stream::open_bytes(passphrase, data)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Human-readable recovery instructions placed at the destination root.
pub const RECOVERY_INFO: &str = "\
scrat backup set — recovery information (format version 1)

Layout:
  backups/<backup_id>/manifest.json.enc   encrypted run manifest (JSON)
  backups/<backup_id>/data.NNN.scrat      encrypted archive segments

Every *.enc and *.scrat file is sealed the same way: an 8-byte magic
\"SCRAT001\", a 32-byte salt, a little-endian u32 chunk size, then a
sequence of AES-256-GCM chunks ([12-byte nonce][u32 length][ciphertext]
[16-byte tag]) ending in an empty authenticated trailer chunk. The
256-bit key is derived from the backup passphrase and the embedded salt
with PBKDF2-HMAC-SHA256 at 100000 iterations.

A segment's decrypted stream is a sequence of file entries, each a
\"SFE1\" header (source, path, size, mtime, mode, codec) followed by
length-prefixed compressed blocks and a zero-length terminator. Codecs:
0 = stored, 1 = lz4, 2 = zstd.

With the passphrase, any backup can be rebuilt from its manifest and
segments alone; the local catalog is a convenience, not a requirement.
Restore tooling: https://github.com/scrat-backup/scrat
";
