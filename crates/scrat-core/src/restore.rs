//! Point-in-time restore: resolve the logical file tree at a timestamp from
//! the catalog, then stream the needed archive segments back, each fetched
//! exactly once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::archive::{self, EntryHeader};
use crate::catalog::{BackupKind, BackupRow, Catalog, FileFlag};
use crate::config::BackupPolicy;
use crate::crypto::key::MasterKey;
use crate::crypto::stream::{read_prelude, SegmentReader};
use crate::destination::pipe::byte_pipe;
use crate::destination::retry::with_retry;
use crate::destination::{destination_from_config, Destination};
use crate::error::{Result, ScratError};
use crate::events::{EngineEvent, EventSender};
use crate::layout;
use crate::scanner::BaseFileMeta;

#[derive(Debug, Clone)]
pub struct RestorePoint {
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: BackupKind,
}

/// Completed backups usable as restore targets, newest first.
pub fn list_restorable_points(
    catalog: &Catalog,
    destination_ref: &str,
) -> Result<Vec<RestorePoint>> {
    let mut rows = catalog.completed_backups(destination_ref)?;
    rows.reverse();
    Ok(rows
        .into_iter()
        .map(|b| RestorePoint {
            backup_id: b.backup_id,
            timestamp: b.started_at,
            kind: b.kind,
        })
        .collect())
}

/// One file of the logical tree at the requested point in time, with the
/// archive placement needed to get its bytes back.
#[derive(Debug, Clone)]
pub struct FileState {
    pub source_root: String,
    pub relative_path: String,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub source_backup_id: String,
    pub archive_name: String,
    pub segment_offset: u64,
    pub segment_length: u64,
}

/// Resolve the file tree as it existed at `at`: the newest completed full
/// backup at or before `at`, plus its incremental descendants up to `at`,
/// applied present/deleted in last-writer-wins order.
pub fn resolve_file_state(
    catalog: &Catalog,
    destination_ref: &str,
    at: DateTime<Utc>,
) -> Result<Vec<FileState>> {
    let completed = catalog.completed_backups(destination_ref)?;

    let full = completed
        .iter()
        .filter(|b| b.kind == BackupKind::Full && b.started_at <= at)
        .next_back()
        .ok_or_else(|| {
            ScratError::Validation(format!("no completed full backup at or before {at}"))
        })?;

    let mut members = chain_members(full, &completed);
    members.retain(|b| b.started_at <= at);
    sort_for_replay(&mut members);

    let mut state: HashMap<(String, String), FileState> = HashMap::new();
    for row in &members {
        apply_backup_rows(catalog, row, &mut state)?;
    }

    let mut files: Vec<FileState> = state.into_values().collect();
    files.sort_by(|a, b| {
        (a.source_root.as_str(), a.relative_path.as_str())
            .cmp(&(b.source_root.as_str(), b.relative_path.as_str()))
    });
    Ok(files)
}

/// Logical state produced by the chain ending exactly at `last` — what the
/// scanner diffs an incremental against.
pub(crate) fn chain_state_ending_at(
    catalog: &Catalog,
    last: &BackupRow,
) -> Result<HashMap<(String, String), BaseFileMeta>> {
    let completed = catalog.completed_backups(&last.destination_ref)?;
    let by_id: HashMap<&str, &BackupRow> =
        completed.iter().map(|b| (b.backup_id.as_str(), b)).collect();

    // Walk ancestors from `last` back to its full, then replay forward.
    let mut lineage: Vec<&BackupRow> = Vec::new();
    let mut cursor = last;
    loop {
        lineage.push(cursor);
        if cursor.kind == BackupKind::Full {
            break;
        }
        match cursor
            .base_backup_id
            .as_deref()
            .and_then(|id| by_id.get(id).copied())
        {
            Some(parent) => cursor = parent,
            None => break,
        }
    }
    lineage.reverse();

    let mut state: HashMap<(String, String), FileState> = HashMap::new();
    for row in lineage {
        apply_backup_rows(catalog, row, &mut state)?;
    }

    Ok(state
        .into_iter()
        .map(|(key, f)| {
            (
                key,
                BaseFileMeta {
                    size: f.size,
                    mtime: f.mtime,
                },
            )
        })
        .collect())
}

/// The full backup plus every completed incremental whose base lineage
/// reaches it.
fn chain_members<'a>(full: &'a BackupRow, completed: &'a [BackupRow]) -> Vec<&'a BackupRow> {
    let by_id: HashMap<&str, &BackupRow> =
        completed.iter().map(|b| (b.backup_id.as_str(), b)).collect();

    let mut members = vec![full];
    for row in completed.iter().filter(|b| b.kind == BackupKind::Incremental) {
        let mut cursor = row;
        loop {
            match cursor
                .base_backup_id
                .as_deref()
                .and_then(|id| by_id.get(id).copied())
            {
                Some(parent) if parent.backup_id == full.backup_id => {
                    members.push(row);
                    break;
                }
                Some(parent) if parent.kind == BackupKind::Full => break,
                Some(parent) => cursor = parent,
                None => break,
            }
        }
    }
    members
}

/// Replay order: `finished_at`, ties broken by backup id. Two same-second
/// writers of one path resolve to the lexicographically greater id.
fn sort_for_replay(members: &mut [&BackupRow]) {
    members.sort_by(|a, b| {
        let ka = (a.finished_at.unwrap_or(a.started_at), a.backup_id.as_str());
        let kb = (b.finished_at.unwrap_or(b.started_at), b.backup_id.as_str());
        ka.cmp(&kb)
    });
}

fn apply_backup_rows(
    catalog: &Catalog,
    row: &BackupRow,
    state: &mut HashMap<(String, String), FileState>,
) -> Result<()> {
    for file in catalog.files_for_backup(&row.backup_id)? {
        let key = (file.source_root.clone(), file.relative_path.clone());
        match file.flag {
            FileFlag::Present => {
                let archive_name = file.archive_name.ok_or_else(|| {
                    ScratError::Internal(format!(
                        "present file '{}' has no archive placement",
                        file.relative_path
                    ))
                })?;
                state.insert(
                    key,
                    FileState {
                        source_root: file.source_root,
                        relative_path: file.relative_path,
                        size: file.logical_size,
                        mtime: file.mtime,
                        mode: file.mode,
                        source_backup_id: row.backup_id.clone(),
                        archive_name,
                        segment_offset: file.segment_offset.unwrap_or(0),
                        segment_length: file.segment_length.unwrap_or(0),
                    },
                );
            }
            FileFlag::Deleted => {
                state.remove(&key);
            }
        }
    }
    Ok(())
}

// No Debug derive: the request carries the passphrase.
#[derive(Clone)]
pub struct RestoreRequest {
    pub destination_id: String,
    pub at: DateTime<Utc>,
    pub passphrase: String,
    /// Relative paths (files or directory prefixes); `None` restores the
    /// whole tree.
    pub selection: Option<HashSet<String>>,
    pub target_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FailedFile {
    pub relative_path: String,
    pub archive_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOutcome {
    pub files_restored: u64,
    pub bytes_restored: u64,
    /// Files whose segment failed authentication; other segments' files
    /// restore regardless.
    pub failed: Vec<FailedFile>,
}

/// Run a point-in-time restore into `target_dir`.
pub fn run_restore(
    catalog: &Catalog,
    policy: &BackupPolicy,
    request: &RestoreRequest,
    events: &EventSender,
) -> Result<RestoreOutcome> {
    let run_id = format!("restore_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    events.emit(EngineEvent::RestoreStarted {
        run_id: run_id.clone(),
    });

    match restore_inner(catalog, policy, request, events, &run_id) {
        Ok(outcome) => {
            events.emit(EngineEvent::RestoreCompleted {
                run_id,
                files_restored: outcome.files_restored,
                files_failed: outcome.failed.len() as u64,
            });
            Ok(outcome)
        }
        Err(e) => {
            events.emit(EngineEvent::RestoreFailed {
                run_id,
                kind: e.kind_name().to_string(),
                message: e.to_string(),
            });
            Err(e)
        }
    }
}

fn restore_inner(
    catalog: &Catalog,
    policy: &BackupPolicy,
    request: &RestoreRequest,
    events: &EventSender,
    run_id: &str,
) -> Result<RestoreOutcome> {
    let dest_config = catalog.destination(&request.destination_id)?.ok_or_else(|| {
        ScratError::Validation(format!("unknown destination '{}'", request.destination_id))
    })?;

    let resolved = resolve_file_state(catalog, &request.destination_id, request.at)?;
    let selected: Vec<FileState> = match &request.selection {
        Some(selection) => resolved
            .into_iter()
            .filter(|f| path_selected(&f.relative_path, selection))
            .collect(),
        None => resolved,
    };

    // Check the passphrase against every involved backup before touching
    // the destination; a mismatch must not write a single file.
    let mut keys: HashMap<String, MasterKey> = HashMap::new();
    for state in &selected {
        if keys.contains_key(&state.source_backup_id) {
            continue;
        }
        let row = catalog.backup(&state.source_backup_id)?.ok_or_else(|| {
            ScratError::Internal(format!(
                "backup '{}' referenced by restore is missing",
                state.source_backup_id
            ))
        })?;
        let key = MasterKey::derive(&request.passphrase, &row.salt_array()?);
        if !key.matches_verifier(&row.verifier) {
            return Err(ScratError::Passphrase);
        }
        keys.insert(state.source_backup_id.clone(), key);
    }

    let multi_source = selected
        .iter()
        .map(|f| f.source_root.as_str())
        .collect::<HashSet<_>>()
        .len()
        > 1;
    let files_total = selected.len() as u64;

    // One fetch per segment: group the needed slices per archive.
    let mut groups: BTreeMap<(String, String), Vec<FileState>> = BTreeMap::new();
    for state in selected {
        groups
            .entry((state.source_backup_id.clone(), state.archive_name.clone()))
            .or_default()
            .push(state);
    }

    let mut dest = destination_from_config(&dest_config)?;
    with_retry(&policy.retry, "connect", || dest.connect())?;

    let mut outcome = RestoreOutcome::default();
    for ((backup_id, archive_name), mut slices) in groups {
        slices.sort_by_key(|s| s.segment_offset);
        let key = keys
            .get(&backup_id)
            .ok_or_else(|| ScratError::Internal("restore key not derived".into()))?;
        let remote_path = format!("{}/{archive_name}", layout::backup_dir(&backup_id));

        let segment = with_retry(&policy.retry, "segment restore", || {
            process_segment(
                dest.as_mut(),
                &remote_path,
                key,
                &slices,
                &request.target_dir,
                multi_source,
            )
        })?;

        outcome.files_restored += segment.restored;
        outcome.bytes_restored += segment.bytes;
        outcome.failed.extend(segment.failed);

        events.emit(EngineEvent::RestoreProgress {
            run_id: run_id.to_string(),
            bytes_done: outcome.bytes_restored,
            files_done: outcome.files_restored,
            files_total,
            current_path: None,
        });
    }

    let _ = dest.disconnect();
    info!(
        files = outcome.files_restored,
        failed = outcome.failed.len(),
        bytes = outcome.bytes_restored,
        "restore finished"
    );
    Ok(outcome)
}

fn path_selected(path: &str, selection: &HashSet<String>) -> bool {
    selection.iter().any(|raw| {
        let sel = raw.trim_end_matches('/');
        path == sel || path.starts_with(&format!("{sel}/"))
    })
}

#[derive(Debug, Default)]
struct SegmentRestore {
    restored: u64,
    bytes: u64,
    failed: Vec<FailedFile>,
}

/// Fetch one segment and materialize all its requested slices. The segment
/// streams through a pipe from a downloader thread; slices come out in
/// offset order from a single pass over the decrypted stream.
fn process_segment(
    dest: &mut dyn Destination,
    remote_path: &str,
    key: &MasterKey,
    slices: &[FileState],
    target_dir: &Path,
    multi_source: bool,
) -> Result<SegmentRestore> {
    std::thread::scope(|scope| {
        let (mut pipe_writer, pipe_reader) = byte_pipe();
        let downloader =
            scope.spawn(move || dest.get_stream(remote_path, &mut pipe_writer, None));

        let extraction = extract_slices(pipe_reader, key, slices, target_dir, multi_source);

        let download = downloader
            .join()
            .map_err(|_| ScratError::Internal("segment download thread panicked".into()))?;

        match (extraction, download) {
            (Ok(result), Ok(_)) => Ok(result),
            (Ok(result), Err(e)) => {
                // Extraction got everything it needed; the tail of the
                // download failing is harmless.
                if result.failed.is_empty() && result.restored == slices.len() as u64 {
                    warn!(error = %e, "segment download ended early after all slices were read");
                    Ok(result)
                } else {
                    Err(e)
                }
            }
            // Stream read problems surface as per-file failures inside
            // extraction, so an extraction Err is always a local fault
            // (bad plan, target I/O) and outranks the download error.
            (Err(e), _) => Err(e),
        }
    })
}

/// Plaintext-position-tracking reader over the decrypted segment stream.
struct CountingReader<R> {
    inner: R,
    pos: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(out)?;
        self.pos += n as u64;
        Ok(n)
    }
}

fn extract_slices(
    pipe_reader: crate::destination::pipe::PipeReader,
    key: &MasterKey,
    slices: &[FileState],
    target_dir: &Path,
    multi_source: bool,
) -> Result<SegmentRestore> {
    let mut out = SegmentRestore::default();

    let mut raw = pipe_reader;
    let segment = read_prelude(&mut raw).and_then(|prelude| SegmentReader::new(raw, key, &prelude));
    let mut reader = match segment {
        Ok(segment) => CountingReader {
            inner: segment,
            pos: 0,
        },
        Err(e) if matches!(e, ScratError::Integrity(_)) => {
            fail_remaining(&mut out, slices, &e);
            return Ok(out);
        }
        Err(e) => return Err(e),
    };

    for (index, slice) in slices.iter().enumerate() {
        match restore_one(&mut reader, slice, target_dir, multi_source) {
            Ok(bytes) => {
                out.restored += 1;
                out.bytes += bytes;
            }
            Err(e @ ScratError::Integrity(_)) => {
                // Authenticated bytes already written are good; this file
                // and everything after it in this segment are lost.
                fail_remaining(&mut out, &slices[index..], &e);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    // Drain so the downloader can finish its stream cleanly.
    let _ = std::io::copy(&mut reader, &mut std::io::sink());
    Ok(out)
}

fn fail_remaining(out: &mut SegmentRestore, slices: &[FileState], err: &ScratError) {
    for slice in slices {
        out.failed.push(FailedFile {
            relative_path: slice.relative_path.clone(),
            archive_name: slice.archive_name.clone(),
            message: err.to_string(),
        });
    }
}

fn restore_one<R: Read>(
    reader: &mut CountingReader<R>,
    slice: &FileState,
    target_dir: &Path,
    multi_source: bool,
) -> Result<u64> {
    // Skip the gap to this entry within the decrypted stream.
    let gap = slice
        .segment_offset
        .checked_sub(reader.pos)
        .ok_or_else(|| ScratError::Internal("restore slices out of order".into()))?;
    let skipped = std::io::copy(&mut reader.by_ref().take(gap), &mut std::io::sink())
        .map_err(crate::error::io_to_integrity)?;
    if skipped != gap {
        return Err(ScratError::Integrity("segment ends before entry offset".into()));
    }

    let header = EntryHeader::read_from(reader)?;
    if header.path != slice.relative_path {
        return Err(ScratError::Integrity(format!(
            "catalog and archive disagree: expected '{}', found '{}'",
            slice.relative_path, header.path
        )));
    }

    let out_path = materialize_path(target_dir, &header, multi_source);
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::File::create(&out_path)?;
    let written = match archive::copy_payload(reader, header.codec, &mut file) {
        Ok(n) => n,
        Err(e) => {
            drop(file);
            // Unauthenticated partial plaintext must not survive on disk.
            if matches!(e, ScratError::Integrity(_)) {
                let _ = std::fs::remove_file(&out_path);
            }
            return Err(e);
        }
    };
    file.sync_all()?;
    drop(file);

    apply_file_attributes(&out_path, &header);
    Ok(written)
}

/// Target path with OS-native separators; multi-source restores keep each
/// source under its own top-level directory.
fn materialize_path(target_dir: &Path, header: &EntryHeader, multi_source: bool) -> PathBuf {
    let mut path = target_dir.to_path_buf();
    if multi_source {
        path.push(&header.source);
    }
    for part in header.path.split('/').filter(|p| !p.is_empty()) {
        path.push(part);
    }
    path
}

fn apply_file_attributes(path: &Path, header: &EntryHeader) {
    #[cfg(unix)]
    if header.mode != 0 {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(header.mode & 0o7777))
        {
            warn!(path = %path.display(), error = %e, "could not restore permissions");
        }
    }

    let mtime = filetime::FileTime::from_unix_time(header.mtime, 0);
    if let Err(e) = filetime::set_file_mtime(path, mtime) {
        warn!(path = %path.display(), error = %e, "could not restore mtime");
    }
}
