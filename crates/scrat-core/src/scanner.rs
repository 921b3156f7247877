use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::config::{builtin_exclude_patterns, SourceConfig};
use crate::error::{Result, ScratError};

/// Filesystems commonly store mtimes at second granularity; differences at
/// or below this are not a change.
pub const MTIME_RESOLUTION_SECS: i64 = 1;

/// One file found under a source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Name of the source this file belongs to.
    pub source_root: String,
    /// Path relative to the source root, forward slashes on every OS.
    pub relative_path: String,
    pub size: u64,
    /// Modification time in unix seconds; negative for pre-1970 stamps.
    pub mtime: i64,
    pub mode: u32,
    /// Absolute path used to read the file during the run.
    pub abs_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScanError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Records in lexicographic `relative_path` order.
    pub records: Vec<FileRecord>,
    pub errors: Vec<ScanError>,
}

/// Size and mtime of a file as the base backup recorded it.
#[derive(Debug, Clone, Copy)]
pub struct BaseFileMeta {
    pub size: u64,
    pub mtime: i64,
}

/// Scanner diff output: what goes into the archive stream, and what is
/// recorded as deleted.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub changed: Vec<FileRecord>,
    pub deleted: Vec<FileRecord>,
    pub unchanged: u64,
}

/// Returns `true` for I/O errors safe to skip (permission denied, vanished).
pub(crate) fn is_soft_io_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
    )
}

fn build_exclude_matcher(
    root: &Path,
    extra_patterns: &[String],
) -> Result<ignore::gitignore::Gitignore> {
    let mut builder = ignore::gitignore::GitignoreBuilder::new(root);
    for pattern in builtin_exclude_patterns() {
        builder
            .add_line(None, pattern)
            .map_err(|e| ScratError::Internal(format!("built-in exclude '{pattern}': {e}")))?;
    }
    for pattern in extra_patterns {
        builder
            .add_line(None, pattern)
            .map_err(|e| ScratError::Validation(format!("invalid exclude pattern '{pattern}': {e}")))?;
    }
    builder
        .build()
        .map_err(|e| ScratError::Internal(format!("exclude matcher build failed: {e}")))
}

/// Join path components with forward slashes regardless of host OS.
fn normalize_rel_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Walk one source root and collect file records in stable lexicographic
/// order. Unreadable entries are reported, not fatal.
pub fn scan_source(source: &SourceConfig) -> Result<ScanOutcome> {
    let root = Path::new(&source.root_path);
    if !root.is_dir() {
        return Err(ScratError::Validation(format!(
            "source '{}' root is not a directory: {}",
            source.name, source.root_path
        )));
    }

    let matcher = build_exclude_matcher(root, &source.exclude_patterns)?;

    let mut walker = WalkBuilder::new(root);
    walker.follow_links(false);
    walker.hidden(false);
    walker.ignore(false);
    walker.git_global(false);
    walker.git_exclude(false);
    walker.git_ignore(false);
    walker.require_git(false);
    walker.parents(false);
    walker.sort_by_file_name(std::ffi::OsStr::cmp);

    let root_owned = root.to_path_buf();
    walker.filter_entry(move |entry| {
        let path = entry.path();
        if path == root_owned {
            return true;
        }
        let rel = path.strip_prefix(&root_owned).unwrap_or(path);
        let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
        !matcher.matched_path_or_any_parents(rel, is_dir).is_ignore()
    });

    let mut outcome = ScanOutcome::default();

    for entry_result in walker.build() {
        let entry = match entry_result {
            Ok(e) => e,
            Err(e) => {
                if e.io_error().is_some_and(is_soft_io_error) {
                    warn!(error = %e, "skipping entry during scan");
                    outcome.errors.push(ScanError {
                        path: String::new(),
                        message: e.to_string(),
                    });
                    continue;
                }
                return Err(ScratError::Internal(format!("walk error: {e}")));
            }
        };

        let path = entry.path();
        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() {
            debug!(path = %path.display(), "skipping symlink");
            continue;
        }
        if !file_type.is_file() {
            continue; // sockets, fifos, devices
        }

        let metadata = match path.metadata() {
            Ok(m) => m,
            Err(e) => {
                if is_soft_io_error(&e) {
                    warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                    outcome.errors.push(ScanError {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
                return Err(e.into());
            }
        };

        let rel = path.strip_prefix(root).unwrap_or(path);
        let relative_path = normalize_rel_path(rel);
        if relative_path.is_empty() {
            continue;
        }

        let mtime = metadata
            .modified()
            .map(unix_seconds)
            .unwrap_or_default();

        outcome.records.push(FileRecord {
            source_root: source.name.clone(),
            relative_path,
            size: metadata.len(),
            mtime,
            mode: file_mode(&metadata),
            abs_path: path.to_path_buf(),
        });
    }

    outcome
        .records
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(outcome)
}

/// Compare scanned records against the base backup's file state.
///
/// A record is a change iff the base has no entry for it, its size differs,
/// or its mtime differs by more than the filesystem resolution. Files in the
/// base but absent now come back as deleted records. No content hashing.
pub fn diff_against_base(
    current: Vec<FileRecord>,
    base: &HashMap<(String, String), BaseFileMeta>,
) -> ChangeSet {
    let mut change_set = ChangeSet::default();
    let mut seen: HashSet<(String, String)> = HashSet::with_capacity(current.len());

    for record in current {
        let key = (record.source_root.clone(), record.relative_path.clone());
        match base.get(&key) {
            Some(prev)
                if prev.size == record.size
                    && (prev.mtime - record.mtime).abs() <= MTIME_RESOLUTION_SECS =>
            {
                change_set.unchanged += 1;
            }
            _ => change_set.changed.push(record),
        }
        seen.insert(key);
    }

    for ((source_root, relative_path), meta) in base {
        if !seen.contains(&(source_root.clone(), relative_path.clone())) {
            change_set.deleted.push(FileRecord {
                source_root: source_root.clone(),
                relative_path: relative_path.clone(),
                size: meta.size,
                mtime: meta.mtime,
                mode: 0,
                abs_path: PathBuf::new(),
            });
        }
    }

    change_set
        .deleted
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    change_set
}
