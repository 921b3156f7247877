use std::collections::VecDeque;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use tracing::warn;

use super::{CancelToken, SkippedFile};
use crate::archive::ArchiveWriter;
use crate::archive::EntryHeader;
use crate::catalog::{FileFlag, FileRow};
use crate::compress::Codec;
use crate::config::BackupPolicy;
use crate::crypto::key::MasterKey;
use crate::crypto::stream::SegmentWriter;
use crate::destination::pipe::byte_pipe;
use crate::destination::retry::with_retry;
use crate::destination::Destination;
use crate::error::{Result, ScratError};
use crate::events::{EventSender, ProgressTracker};
use crate::scanner::{is_soft_io_error, FileRecord};

pub(super) struct SegmentContext<'a> {
    pub backup_id: &'a str,
    pub key: &'a MasterKey,
    pub salt: &'a [u8; 32],
    pub policy: &'a BackupPolicy,
    pub codec: Codec,
    pub events: &'a EventSender,
    pub cancel: &'a CancelToken,
    pub spool_dir: Option<&'a Path>,
}

pub(super) struct SegmentOutcome {
    pub files: Vec<FileRow>,
    pub logical_size: u64,
    pub stored_size: u64,
    pub source_bytes: u64,
    pub skipped: Vec<SkippedFile>,
}

struct FillOutput {
    files: Vec<FileRow>,
    logical_size: u64,
    source_bytes: u64,
    skipped: Vec<SkippedFile>,
}

/// Drain files from the queue into one segment until the split threshold,
/// end of input, or cancellation. Splits only ever land between files.
fn fill_segment<W: Write>(
    segment: SegmentWriter<W>,
    archive_name: &str,
    ctx: &SegmentContext<'_>,
    queue: &mut VecDeque<FileRecord>,
    tracker: &mut ProgressTracker,
) -> Result<(W, u64, FillOutput)> {
    let mut archive = ArchiveWriter::new(segment, ctx.codec);
    let mut out = FillOutput {
        files: Vec::new(),
        logical_size: 0,
        source_bytes: 0,
        skipped: Vec::new(),
    };

    while let Some(record) = queue.pop_front() {
        if ctx.cancel.is_cancelled() {
            return Err(ScratError::Cancelled);
        }
        if !out.files.is_empty()
            && archive.get_ref().stored_bytes() >= ctx.policy.split_size_bytes
        {
            queue.push_front(record);
            break;
        }

        let mut file = match std::fs::File::open(&record.abs_path) {
            Ok(f) => f,
            Err(e) if is_soft_io_error(&e) => {
                warn!(path = %record.abs_path.display(), error = %e, "skipping source file");
                out.skipped.push(SkippedFile {
                    path: record.relative_path.clone(),
                    message: e.to_string(),
                });
                continue;
            }
            Err(e) => {
                return Err(ScratError::Source {
                    path: record.abs_path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        let header = EntryHeader {
            source: record.source_root.clone(),
            path: record.relative_path.clone(),
            size: record.size,
            mtime: record.mtime,
            mode: record.mode,
            codec: ctx.codec,
        };

        let (placement, consumed) = {
            let events = ctx.events;
            let current = record.relative_path.clone();
            let mut on_block = |n: u64| {
                tracker.add_bytes(n);
                tracker.maybe_emit(events, Some(&current), false);
            };
            archive.append_file(&header, &mut file, Some(&mut on_block))?
        };

        out.source_bytes += consumed;
        out.files.push(FileRow {
            backup_id: ctx.backup_id.to_string(),
            source_root: record.source_root,
            relative_path: record.relative_path,
            logical_size: consumed,
            mtime: record.mtime,
            mode: record.mode,
            archive_name: Some(archive_name.to_string()),
            segment_offset: Some(placement.offset),
            segment_length: Some(placement.length),
            flag: FileFlag::Present,
        });
        tracker.file_done();
    }

    out.logical_size = archive.position();
    let segment = archive.into_inner();
    let (inner, stored) = segment.finish()?;
    Ok((inner, stored, out))
}

/// Write one segment to the destination. Streaming destinations get the
/// bytes as they are produced through a pipe and an uploader thread;
/// staged destinations receive the sealed segment from a spool file.
#[allow(clippy::too_many_arguments)]
pub(super) fn write_segment(
    dest: &mut dyn Destination,
    remote_path: &str,
    archive_name: &str,
    iv_seed: [u8; 12],
    ctx: &SegmentContext<'_>,
    queue: &mut VecDeque<FileRecord>,
    tracker: &mut ProgressTracker,
) -> Result<SegmentOutcome> {
    let chunk_size = ctx.policy.chunk_size_bytes;

    if dest.streams_directly() {
        std::thread::scope(|scope| {
            let (pipe_writer, mut pipe_reader) = byte_pipe();
            let uploader =
                scope.spawn(move || dest.put_stream(remote_path, &mut pipe_reader, None));

            let fill = SegmentWriter::new(pipe_writer, ctx.key, ctx.salt, iv_seed, chunk_size)
                .and_then(|segment| fill_segment(segment, archive_name, ctx, queue, tracker))
                .map(|(pipe_writer, _stored, out)| {
                    // Close the pipe so the uploader sees end-of-stream.
                    drop(pipe_writer);
                    out
                });

            let upload = uploader
                .join()
                .map_err(|_| ScratError::Internal("segment uploader thread panicked".into()))?;

            match (fill, upload) {
                (Ok(out), Ok(stored_size)) => Ok(SegmentOutcome {
                    files: out.files,
                    logical_size: out.logical_size,
                    stored_size,
                    source_bytes: out.source_bytes,
                    skipped: out.skipped,
                }),
                (Err(e @ ScratError::Cancelled), _) => Err(e),
                // A broken pipe on the producer side usually means the
                // upload died first; surface the upload error as the cause.
                (Err(_), Err(upload_err)) => Err(upload_err),
                (Err(e), Ok(_)) => Err(e),
                (Ok(_), Err(e)) => Err(e),
            }
        })
    } else {
        let spool = match ctx.spool_dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None => tempfile::NamedTempFile::new()?,
        };

        let writer = spool.as_file().try_clone()?;
        let segment = SegmentWriter::new(writer, ctx.key, ctx.salt, iv_seed, chunk_size)?;
        let (mut writer, _stored, out) =
            fill_segment(segment, archive_name, ctx, queue, tracker)?;
        writer.flush()?;
        drop(writer);

        let stored_size = with_retry(&ctx.policy.retry, "segment upload", || {
            let mut reader = spool.reopen()?;
            reader.seek(SeekFrom::Start(0))?;
            dest.put_stream(remote_path, &mut reader, None)
        })?;

        Ok(SegmentOutcome {
            files: out.files,
            logical_size: out.logical_size,
            stored_size,
            source_bytes: out.source_bytes,
            skipped: out.skipped,
        })
    }
}
