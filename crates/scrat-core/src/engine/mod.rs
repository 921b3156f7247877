//! Backup run orchestration: scan, diff, stream, seal, rotate.

mod rotation;
mod segments;

use std::collections::VecDeque;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::archive::segment_name;
use crate::catalog::{
    BackupKind, BackupRow, BackupStats, BackupStatus, Catalog,
};
use crate::compress::Codec;
use crate::config::{BackupPolicy, SourceConfig};
use crate::crypto::key::{generate_iv_seed, validate_passphrase_strength, MasterKey};
use crate::crypto::stream::{read_prelude, SegmentReader, SegmentWriter};
use crate::destination::retry::with_retry;
use crate::destination::{destination_from_config, Destination};
use crate::error::{io_to_integrity, Result, ScratError};
use crate::events::{EngineEvent, EventSender, ProgressTracker};
use crate::layout;
use crate::manifest::{self, Manifest, ManifestArchive, ManifestSource, ManifestStats};
use crate::scanner::{self, ChangeSet, FileRecord};

/// Cooperative cancellation flag, polled at file boundaries and segment
/// seal points.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedKind {
    Full,
    Incremental,
    /// Full when the destination has no completed backup, else incremental.
    Auto,
}

// No Debug derive: the request carries the passphrase.
#[derive(Clone)]
pub struct BackupRequest {
    pub destination_id: String,
    pub kind: RequestedKind,
    pub passphrase: String,
    /// Source names; `None` selects every enabled source.
    pub sources: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub backup_id: String,
    pub kind: BackupKind,
    pub stats: BackupStats,
    /// Files skipped over soft source errors; the run still completes.
    pub skipped: Vec<SkippedFile>,
    pub duration_seconds: u64,
}

/// Run one backup against the configured destination.
pub fn run(
    catalog: &mut Catalog,
    policy: &BackupPolicy,
    spool_dir: Option<&Path>,
    request: &BackupRequest,
    events: &EventSender,
    cancel: &CancelToken,
) -> Result<BackupOutcome> {
    let run_started = Instant::now();
    policy.validate()?;

    let dest_config = catalog.destination(&request.destination_id)?.ok_or_else(|| {
        ScratError::Validation(format!("unknown destination '{}'", request.destination_id))
    })?;
    let sources = select_sources(catalog, request)?;

    let mut dest = destination_from_config(&dest_config)?;
    with_retry(&policy.retry, "connect", || dest.connect())?;
    catalog.touch_destination_connected(&request.destination_id)?;
    events.emit(EngineEvent::StorageConnected {
        destination_id: request.destination_id.clone(),
    });

    let result = run_connected(
        catalog,
        policy,
        spool_dir,
        request,
        &sources,
        dest.as_mut(),
        events,
        cancel,
        run_started,
    );

    let _ = dest.disconnect();
    events.emit(EngineEvent::StorageDisconnected {
        destination_id: request.destination_id.clone(),
    });
    result
}

fn select_sources(catalog: &Catalog, request: &BackupRequest) -> Result<Vec<SourceConfig>> {
    let all = catalog.sources()?;
    let selected: Vec<SourceConfig> = match &request.sources {
        Some(names) => names
            .iter()
            .map(|name| {
                all.iter()
                    .find(|s| &s.name == name && s.enabled)
                    .cloned()
                    .ok_or_else(|| {
                        ScratError::Validation(format!("unknown or disabled source '{name}'"))
                    })
            })
            .collect::<Result<_>>()?,
        None => all.into_iter().filter(|s| s.enabled).collect(),
    };
    if selected.is_empty() {
        return Err(ScratError::Validation("no enabled sources selected".into()));
    }
    Ok(selected)
}

#[allow(clippy::too_many_arguments)]
fn run_connected(
    catalog: &mut Catalog,
    policy: &BackupPolicy,
    spool_dir: Option<&Path>,
    request: &BackupRequest,
    sources: &[SourceConfig],
    dest: &mut dyn Destination,
    events: &EventSender,
    cancel: &CancelToken,
    run_started: Instant,
) -> Result<BackupOutcome> {
    resolve_unfinished(catalog, dest, &request.destination_id, policy)?;

    let base = catalog.latest_completed(&request.destination_id)?;
    let kind = match request.kind {
        RequestedKind::Full => BackupKind::Full,
        RequestedKind::Incremental => {
            if base.is_none() {
                return Err(ScratError::Validation(
                    "no completed backup to base an incremental on".into(),
                ));
            }
            BackupKind::Incremental
        }
        RequestedKind::Auto => {
            if base.is_none() {
                BackupKind::Full
            } else {
                BackupKind::Incremental
            }
        }
    };

    if base.is_none() {
        // First backup on this destination starts a new chain; gate the
        // passphrase before anything is sealed under it.
        validate_passphrase_strength(&request.passphrase)?;
    }

    let salt = MasterKey::generate_salt();
    let key = MasterKey::derive(&request.passphrase, &salt);
    let verifier = key.verifier()?;

    let base_backup_id = if kind == BackupKind::Incremental {
        let base_row = base.as_ref().ok_or_else(|| {
            ScratError::Internal("incremental resolved without a base".into())
        })?;
        let base_key = MasterKey::derive(&request.passphrase, &base_row.salt_array()?);
        if !base_key.matches_verifier(&base_row.verifier) {
            return Err(ScratError::Passphrase);
        }
        Some(base_row.backup_id.clone())
    } else {
        None
    };

    let (backup_id, started_at) =
        catalog.allocate_backup_id(kind, &request.destination_id, Utc::now())?;
    catalog.create_backup(&BackupRow {
        backup_id: backup_id.clone(),
        kind,
        base_backup_id: base_backup_id.clone(),
        destination_ref: request.destination_id.clone(),
        status: BackupStatus::Running,
        started_at,
        finished_at: None,
        files_total: 0,
        size_original: 0,
        size_stored: 0,
        salt: salt.to_vec(),
        verifier: verifier.clone(),
        error_message: None,
    })?;
    catalog.log(
        "INFO",
        &format!("{} backup started", kind.as_str()),
        Some(&backup_id),
    )?;
    events.emit(EngineEvent::BackupStarted {
        run_id: backup_id.clone(),
    });

    let mut in_flight: Option<u32> = None;
    let result = execute(
        catalog,
        policy,
        spool_dir,
        request,
        sources,
        dest,
        events,
        cancel,
        run_started,
        &backup_id,
        kind,
        base.as_ref(),
        &key,
        &salt,
        &verifier,
        &mut in_flight,
    );

    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            handle_failure(catalog, dest, &backup_id, in_flight, &e, events, policy);
            Err(e)
        }
    }
}

/// The fallible middle of a run; any error here funnels into
/// `handle_failure` for cleanup and status transition.
#[allow(clippy::too_many_arguments)]
fn execute(
    catalog: &mut Catalog,
    policy: &BackupPolicy,
    spool_dir: Option<&Path>,
    request: &BackupRequest,
    sources: &[SourceConfig],
    dest: &mut dyn Destination,
    events: &EventSender,
    cancel: &CancelToken,
    run_started: Instant,
    backup_id: &str,
    kind: BackupKind,
    base: Option<&BackupRow>,
    key: &MasterKey,
    salt: &[u8; 32],
    verifier: &str,
    in_flight: &mut Option<u32>,
) -> Result<BackupOutcome> {
    let mut skipped: Vec<SkippedFile> = Vec::new();

    // Scan every source; soft errors are recorded, not fatal.
    let mut records: Vec<FileRecord> = Vec::new();
    for source in sources {
        let outcome = scanner::scan_source(source)?;
        for error in outcome.errors {
            skipped.push(SkippedFile {
                path: error.path,
                message: error.message,
            });
        }
        records.extend(outcome.records);
    }

    let change = match (kind, base) {
        (BackupKind::Incremental, Some(base_row)) => {
            let state = crate::restore::chain_state_ending_at(catalog, base_row)?;
            scanner::diff_against_base(records, &state)
        }
        _ => ChangeSet {
            changed: records,
            deleted: Vec::new(),
            unchanged: 0,
        },
    };

    catalog.insert_deleted_files(backup_id, &change.deleted)?;
    info!(
        backup_id,
        changed = change.changed.len(),
        deleted = change.deleted.len(),
        unchanged = change.unchanged,
        "change set resolved"
    );

    let bytes_total: u64 = change.changed.iter().map(|r| r.size).sum();
    let files_total = change.changed.len() as u64;
    let mut tracker = ProgressTracker::new(backup_id, bytes_total, files_total);
    tracker.maybe_emit(events, None, true);

    let mut queue: VecDeque<FileRecord> = change.changed.into();
    let mut stats = BackupStats::default();
    let mut manifest_archives: Vec<ManifestArchive> = Vec::new();
    let mut ordinal = 0u32;

    while !queue.is_empty() {
        if cancel.is_cancelled() {
            return Err(ScratError::Cancelled);
        }
        ordinal += 1;
        let name = segment_name(ordinal);
        let iv_seed = generate_iv_seed();
        catalog.open_archive(backup_id, ordinal, &name, &iv_seed)?;
        *in_flight = Some(ordinal);

        let ctx = segments::SegmentContext {
            backup_id,
            key,
            salt,
            policy,
            codec: Codec::from_setting(policy.compression),
            events,
            cancel,
            spool_dir,
        };
        let outcome = segments::write_segment(
            dest,
            &layout::segment_path(backup_id, ordinal),
            &name,
            iv_seed,
            &ctx,
            &mut queue,
            &mut tracker,
        )?;

        catalog.seal_archive(
            backup_id,
            ordinal,
            outcome.logical_size,
            outcome.stored_size,
            &outcome.files,
        )?;
        *in_flight = None;

        info!(
            backup_id,
            segment = %name,
            files = outcome.files.len(),
            stored = outcome.stored_size,
            "segment sealed"
        );

        stats.files_total += outcome.files.len() as u64;
        stats.size_original += outcome.source_bytes;
        stats.size_stored += outcome.stored_size;
        manifest_archives.push(ManifestArchive {
            ordinal,
            name,
            stored_size: outcome.stored_size,
            iv_seed: hex::encode(iv_seed),
            files_count: outcome.files.len() as u64,
        });
        skipped.extend(outcome.skipped);
    }

    let duration_seconds = run_started.elapsed().as_secs();
    let manifest = Manifest {
        backup_id: backup_id.to_string(),
        kind: kind.as_str().to_string(),
        timestamp: Utc::now(),
        base_backup_id: base
            .filter(|_| kind == BackupKind::Incremental)
            .map(|b| b.backup_id.clone()),
        format_version: manifest::FORMAT_VERSION,
        sources: sources
            .iter()
            .map(|s| ManifestSource {
                name: s.name.clone(),
                path: s.root_path.clone(),
            })
            .collect(),
        archives: manifest_archives,
        stats: ManifestStats {
            files_total: stats.files_total,
            size_original: stats.size_original,
            size_stored: stats.size_stored,
            duration_seconds,
        },
        verifier: verifier.to_string(),
    };
    let sealed = manifest::seal(&manifest, key, salt)?;
    with_retry(&policy.retry, "manifest upload", || {
        dest.put_stream(&layout::manifest_path(backup_id), &mut sealed.as_slice(), None)
    })?;

    if !dest.stat(layout::RECOVERY_INFO_PATH)?.exists {
        with_retry(&policy.retry, "recovery info upload", || {
            dest.put_stream(
                layout::RECOVERY_INFO_PATH,
                &mut manifest::RECOVERY_INFO.as_bytes(),
                None,
            )
        })?;
    }

    catalog.mark_backup_completed(backup_id, &stats, Utc::now())?;
    tracker.maybe_emit(events, None, true);
    events.emit(EngineEvent::BackupCompleted {
        run_id: backup_id.to_string(),
        files_total: stats.files_total,
        size_original: stats.size_original,
        size_stored: stats.size_stored,
        duration_seconds,
    });
    catalog.log(
        "INFO",
        &format!(
            "backup completed: {} files, {} bytes original, {} bytes stored, {} skipped",
            stats.files_total,
            stats.size_original,
            stats.size_stored,
            skipped.len()
        ),
        Some(backup_id),
    )?;

    rotation::apply(catalog, dest, &request.destination_id, policy.max_versions, &policy.retry)?;

    if policy.upload_catalog_copy {
        if let Err(e) = upload_catalog_copy(catalog, dest, key, salt, spool_dir, policy) {
            warn!(error = %e, "catalog copy upload failed; backups are unaffected");
        }
    }

    if policy.verify_after_backup {
        verify_segments(catalog, dest, backup_id, &request.passphrase, spool_dir, policy)?;
    }

    Ok(BackupOutcome {
        backup_id: backup_id.to_string(),
        kind,
        stats,
        skipped,
        duration_seconds,
    })
}

/// Resolve leftovers of interrupted runs before starting a new one: drop
/// their objects from the destination and rewrite the rows to `failed`.
/// The prior byte stream is never continued.
fn resolve_unfinished(
    catalog: &mut Catalog,
    dest: &mut dyn Destination,
    destination_ref: &str,
    policy: &BackupPolicy,
) -> Result<()> {
    for leftover in catalog.unfinished_backups(destination_ref)? {
        warn!(
            backup_id = %leftover.backup_id,
            status = leftover.status.as_str(),
            "resolving interrupted backup"
        );
        match with_retry(&policy.retry, "orphan cleanup", || {
            dest.delete_tree(&layout::backup_dir(&leftover.backup_id))
        }) {
            Ok(()) => {
                catalog.clear_backup_contents(&leftover.backup_id)?;
                catalog.mark_backup_failed(&leftover.backup_id, "interrupted run cleaned up")?;
                catalog.log(
                    "WARNING",
                    "interrupted backup cleaned up",
                    Some(&leftover.backup_id),
                )?;
            }
            Err(e) => {
                // Leave it for the next run; the new backup can proceed.
                warn!(
                    backup_id = %leftover.backup_id,
                    error = %e,
                    "could not clean up interrupted backup"
                );
            }
        }
    }
    Ok(())
}

fn handle_failure(
    catalog: &mut Catalog,
    dest: &mut dyn Destination,
    backup_id: &str,
    in_flight: Option<u32>,
    err: &ScratError,
    events: &EventSender,
    policy: &BackupPolicy,
) {
    let cancelled = matches!(err, ScratError::Cancelled);

    let cleanup: Result<()> = (|| {
        if cancelled {
            // A cancelled run leaves nothing behind: failed backups are
            // never restorable, so their segments are dead weight.
            with_retry(&policy.retry, "cancel cleanup", || {
                dest.delete_tree(&layout::backup_dir(backup_id))
            })?;
            catalog.clear_backup_contents(backup_id)?;
        } else if let Some(ordinal) = in_flight {
            with_retry(&policy.retry, "segment cleanup", || {
                dest.delete(&layout::segment_path(backup_id, ordinal))
            })?;
            catalog.discard_archive(backup_id, ordinal)?;
        }
        Ok(())
    })();

    let reason = if cancelled {
        "cancelled".to_string()
    } else {
        err.to_string()
    };

    let status_update = match cleanup {
        Ok(()) => catalog.mark_backup_failed(backup_id, &reason),
        Err(cleanup_err) => {
            warn!(
                backup_id,
                error = %cleanup_err,
                "cleanup after failure did not complete"
            );
            catalog.mark_backup_partial(backup_id, &reason)
        }
    };
    if let Err(e) = status_update {
        warn!(backup_id, error = %e, "could not record backup failure");
    }
    let _ = catalog.log("ERROR", &format!("backup failed: {reason}"), Some(backup_id));

    events.emit(EngineEvent::BackupFailed {
        run_id: backup_id.to_string(),
        kind: err.kind_name().to_string(),
        message: reason,
    });
}

/// Upload an encrypted snapshot of the catalog next to the backup sets.
fn upload_catalog_copy(
    catalog: &Catalog,
    dest: &mut dyn Destination,
    key: &MasterKey,
    salt: &[u8; 32],
    spool_dir: Option<&Path>,
    policy: &BackupPolicy,
) -> Result<()> {
    if catalog.db_path().is_none() {
        return Ok(()); // in-memory catalog, nothing durable to copy
    }

    let snapshot_dir = tempfile::tempdir()?;
    let snapshot_path = snapshot_dir.path().join("catalog.db");
    catalog.export_snapshot(&snapshot_path)?;

    let sealed = match spool_dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new()?,
    };
    let mut writer = SegmentWriter::new(
        sealed.as_file().try_clone()?,
        key,
        salt,
        generate_iv_seed(),
        1024 * 1024,
    )?;
    let mut snapshot = std::fs::File::open(&snapshot_path)?;
    std::io::copy(&mut snapshot, &mut writer)?;
    let (file, _stored) = writer.finish()?;
    drop(file);

    with_retry(&policy.retry, "catalog copy upload", || {
        let mut reader = sealed.reopen()?;
        reader.seek(SeekFrom::Start(0))?;
        dest.put_stream(layout::CATALOG_COPY_PATH, &mut reader, None)
    })?;
    Ok(())
}

/// Re-download every sealed segment of the run and authenticate all chunks.
/// The plaintext is discarded; this only proves the tags.
fn verify_segments(
    catalog: &Catalog,
    dest: &mut dyn Destination,
    backup_id: &str,
    passphrase: &str,
    spool_dir: Option<&Path>,
    policy: &BackupPolicy,
) -> Result<()> {
    for archive in catalog.archives_for_backup(backup_id)? {
        let path = layout::segment_path(backup_id, archive.ordinal);
        let mut spool = with_retry(&policy.retry, "verify download", || {
            let mut file = match spool_dir {
                Some(dir) => tempfile::tempfile_in(dir)?,
                None => tempfile::tempfile()?,
            };
            dest.get_stream(&path, &mut file, None)?;
            Ok(file)
        })?;

        spool.seek(SeekFrom::Start(0))?;
        let prelude = read_prelude(&mut spool)?;
        let key = MasterKey::derive(passphrase, &prelude.salt);
        let mut reader = SegmentReader::new(spool, &key, &prelude)?;
        std::io::copy(&mut reader, &mut std::io::sink()).map_err(io_to_integrity)?;
        info!(backup_id, segment = %archive.name, "segment verified");
    }
    Ok(())
}
