//! Streaming container format carried inside the encrypted segment stream.
//!
//! A segment's plaintext is a sequence of self-delimiting file entries:
//!
//! ```text
//! [ entry magic "SFE1" (4B) ]
//! [ source_len u16 LE ][ source ]        backup source name
//! [ path_len u16 LE ][ path ]            relative path, forward slashes
//! [ size u64 LE ][ mtime i64 LE ][ mode u32 LE ][ codec tag u8 ]
//! repeated payload blocks:
//!   [ block_len u32 LE ][ compressed block ]
//! [ 0u32 terminator ]
//! ```
//!
//! There is no end-of-stream index; entries can be scanned sequentially,
//! which is what disaster recovery without the catalog relies on.

use std::io::{Read, Write};

use crate::compress::{self, Codec, BLOCK_SIZE};
use crate::error::{io_to_integrity, Result, ScratError};

const ENTRY_MAGIC: [u8; 4] = *b"SFE1";

/// Worst-case stored size of one compressed block (lz4 incompressible-input
/// expansion plus framing headroom).
const MAX_STORED_BLOCK: u32 = (BLOCK_SIZE + BLOCK_SIZE / 16 + 1024) as u32;

pub fn segment_name(ordinal: u32) -> String {
    format!("data.{ordinal:03}.scrat")
}

/// Per-file metadata carried in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub source: String,
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub codec: Codec,
}

impl EntryHeader {
    fn encode(&self) -> Result<Vec<u8>> {
        let source = self.source.as_bytes();
        let path = self.path.as_bytes();
        if source.len() > u16::MAX as usize || path.len() > u16::MAX as usize {
            return Err(ScratError::Validation(format!(
                "path too long for archive entry: '{}'",
                self.path
            )));
        }

        let mut out = Vec::with_capacity(4 + 2 + source.len() + 2 + path.len() + 8 + 8 + 4 + 1);
        out.extend_from_slice(&ENTRY_MAGIC);
        out.extend_from_slice(&(source.len() as u16).to_le_bytes());
        out.extend_from_slice(source);
        out.extend_from_slice(&(path.len() as u16).to_le_bytes());
        out.extend_from_slice(path);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.push(self.codec.tag());
        Ok(out)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<EntryHeader> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(io_to_integrity)?;
        if magic != ENTRY_MAGIC {
            return Err(ScratError::Integrity(format!(
                "bad archive entry magic: {magic:02x?}"
            )));
        }

        let source = read_string(reader)?;
        let path = read_string(reader)?;
        let size = read_u64(reader)?;
        let mtime = read_u64(reader)? as i64;
        let mode = read_u32(reader)?;

        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag).map_err(io_to_integrity)?;
        let codec = Codec::from_tag(tag[0])?;

        Ok(EntryHeader {
            source,
            path,
            size,
            mtime,
            mode,
            codec,
        })
    }
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).map_err(io_to_integrity)?;
    let mut raw = vec![0u8; u16::from_le_bytes(len_bytes) as usize];
    reader.read_exact(&mut raw).map_err(io_to_integrity)?;
    String::from_utf8(raw).map_err(|_| ScratError::Integrity("entry path is not UTF-8".into()))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut raw = [0u8; 8];
    reader.read_exact(&mut raw).map_err(io_to_integrity)?;
    Ok(u64::from_le_bytes(raw))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw).map_err(io_to_integrity)?;
    Ok(u32::from_le_bytes(raw))
}

/// Placement of one file within the segment's plaintext stream.
#[derive(Debug, Clone, Copy)]
pub struct FilePlacement {
    pub offset: u64,
    pub length: u64,
}

/// Writes file entries into a segment stream, tracking the plaintext offset
/// so the engine can record placements as each file completes.
pub struct ArchiveWriter<W: Write> {
    inner: W,
    codec: Codec,
    offset: u64,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W, codec: Codec) -> Self {
        Self {
            inner,
            codec,
            offset: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Append one file. Returns its placement and the number of source bytes
    /// actually consumed (the file may have changed since the scan).
    pub fn append_file(
        &mut self,
        header: &EntryHeader,
        reader: &mut dyn Read,
        mut progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<(FilePlacement, u64)> {
        let start = self.offset;

        let encoded = header.encode()?;
        self.inner.write_all(&encoded)?;
        self.offset += encoded.len() as u64;

        let mut block = vec![0u8; BLOCK_SIZE];
        let mut consumed = 0u64;
        loop {
            let n = read_full(reader, &mut block)?;
            if n == 0 {
                break;
            }
            consumed += n as u64;

            let packed = compress::compress_block(self.codec, &block[..n])?;
            self.inner.write_all(&(packed.len() as u32).to_le_bytes())?;
            self.inner.write_all(&packed)?;
            self.offset += 4 + packed.len() as u64;

            if let Some(cb) = progress.as_deref_mut() {
                cb(n as u64);
            }
        }

        self.inner.write_all(&0u32.to_le_bytes())?;
        self.offset += 4;

        Ok((
            FilePlacement {
                offset: start,
                length: self.offset - start,
            },
            consumed,
        ))
    }
}

/// Fill `buf` as far as the reader allows; a short count only at EOF.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Stream one entry's payload out, decompressing block by block.
/// Returns the number of plaintext bytes written.
pub fn copy_payload<R: Read>(
    reader: &mut R,
    codec: Codec,
    out: &mut dyn Write,
) -> Result<u64> {
    let mut written = 0u64;
    let mut packed = Vec::new();
    loop {
        let len = read_u32(reader)?;
        if len == 0 {
            break;
        }
        if len > MAX_STORED_BLOCK {
            return Err(ScratError::Integrity(format!(
                "stored block of {len} bytes exceeds the block bound"
            )));
        }
        packed.resize(len as usize, 0);
        reader.read_exact(&mut packed).map_err(io_to_integrity)?;
        let plain = compress::decompress_block(codec, &packed)?;
        out.write_all(&plain)?;
        written += plain.len() as u64;
    }
    Ok(written)
}

/// Skip over one entry's payload without decompressing it.
pub fn skip_payload<R: Read>(reader: &mut R) -> Result<u64> {
    let mut skipped = 0u64;
    loop {
        let len = read_u32(reader)?;
        if len == 0 {
            break;
        }
        if len > MAX_STORED_BLOCK {
            return Err(ScratError::Integrity(format!(
                "stored block of {len} bytes exceeds the block bound"
            )));
        }
        let copied = std::io::copy(&mut reader.by_ref().take(len as u64), &mut std::io::sink())?;
        if copied != len as u64 {
            return Err(ScratError::Integrity("archive payload truncated".into()));
        }
        skipped += copied;
    }
    Ok(skipped)
}
