//! Streaming AEAD envelope for archive segments.
//!
//! Chunked wire format (the only format writers produce):
//!
//! ```text
//! [ magic "SCRAT001" (8B) ][ salt (32B) ][ chunk_size u32 LE ]
//! repeated:
//!   [ nonce (12B) ][ ciphertext_len u32 LE ][ ciphertext ][ tag (16B) ]
//! trailer:
//!   [ nonce (12B) ][ 0u32 ][ tag (16B) ]   (empty plaintext, AAD "end")
//! ```
//!
//! The legacy single-shot layout `[ salt (32B) | nonce (12B) | ct+tag ]` is
//! accepted on decrypt only.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, AeadInPlace};
use aes_gcm::{Aes256Gcm, Nonce, Tag};

use super::key::{MasterKey, NONCE_LEN, SALT_LEN};
use crate::error::{io_to_integrity, Result, ScratError};

pub const MAGIC: &[u8; 8] = b"SCRAT001";
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024 * 1024;

/// Upper bound on the chunk size a reader will accept.
pub const MAX_CHUNK_SIZE: u32 = 256 * 1024 * 1024;

const TAG_LEN: usize = 16;
const TRAILER_AAD: &[u8] = b"end";

fn nonce_for(iv_seed: &[u8; NONCE_LEN], counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *iv_seed;
    let ctr = counter.to_le_bytes();
    for (n, c) in nonce[4..].iter_mut().zip(ctr.iter()) {
        *n ^= c;
    }
    nonce
}

/// Encrypting writer for one segment. Plaintext is buffered up to
/// `chunk_size`, sealed per chunk, so peak memory is one chunk regardless of
/// segment size.
pub struct SegmentWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    iv_seed: [u8; NONCE_LEN],
    counter: u64,
    chunk_size: usize,
    buf: Vec<u8>,
    stored: u64,
    finished: bool,
}

impl<W: Write> SegmentWriter<W> {
    pub fn new(
        mut inner: W,
        key: &MasterKey,
        salt: &[u8; SALT_LEN],
        iv_seed: [u8; NONCE_LEN],
        chunk_size: u32,
    ) -> Result<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ScratError::Validation(format!(
                "chunk_size {chunk_size} out of range (1..={MAX_CHUNK_SIZE})"
            )));
        }
        if iv_seed == [0u8; NONCE_LEN] {
            return Err(ScratError::Internal("all-zero iv_seed is reserved".into()));
        }

        inner.write_all(MAGIC)?;
        inner.write_all(salt)?;
        inner.write_all(&chunk_size.to_le_bytes())?;

        Ok(Self {
            inner,
            cipher: key.cipher(),
            iv_seed,
            counter: 0,
            chunk_size: chunk_size as usize,
            buf: Vec::new(),
            stored: (MAGIC.len() + SALT_LEN + 4) as u64,
            finished: false,
        })
    }

    /// Bytes committed to the underlying writer plus pending plaintext.
    /// Used by the engine for split decisions.
    pub fn stored_bytes(&self) -> u64 {
        self.stored + self.buf.len() as u64
    }

    fn seal_chunk(&mut self, aad: &[u8]) -> Result<()> {
        let nonce_bytes = nonce_for(&self.iv_seed, self.counter);
        self.counter += 1;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, aad, &mut self.buf)
            .map_err(|e| ScratError::Internal(format!("chunk encrypt: {e}")))?;

        self.inner.write_all(&nonce_bytes)?;
        self.inner.write_all(&(self.buf.len() as u32).to_le_bytes())?;
        self.inner.write_all(&self.buf)?;
        self.inner.write_all(tag.as_slice())?;

        self.stored += (NONCE_LEN + 4 + self.buf.len() + TAG_LEN) as u64;
        self.buf.clear();
        Ok(())
    }

    /// Seal pending plaintext and write the authenticated trailer.
    /// Returns the underlying writer and the total stored byte count.
    pub fn finish(mut self) -> Result<(W, u64)> {
        if !self.buf.is_empty() {
            self.seal_chunk(&[])?;
        }
        // Trailer: empty chunk with distinguishing AAD, so truncation at any
        // chunk boundary is detectable.
        self.seal_chunk(TRAILER_AAD)?;
        self.finished = true;
        self.inner.flush()?;
        Ok((self.inner, self.stored))
    }
}

impl<W: Write> Write for SegmentWriter<W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let take = room.min(remaining.len());
            self.buf.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            if self.buf.len() == self.chunk_size {
                self.seal_chunk(&[]).map_err(std::io::Error::other)?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // Chunks are sealed when full or at finish(); nothing to do here.
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFormat {
    Chunked,
    LegacySingleShot,
}

/// Parsed segment header, read before key derivation.
pub struct SegmentPrelude {
    pub format: SegmentFormat,
    pub salt: [u8; SALT_LEN],
    pub chunk_size: u32,
}

/// Read the segment prelude and sniff the format.
pub fn read_prelude<R: Read>(reader: &mut R) -> Result<SegmentPrelude> {
    let mut head = [0u8; 8];
    reader.read_exact(&mut head).map_err(io_to_integrity)?;

    if &head == MAGIC {
        let mut salt = [0u8; SALT_LEN];
        reader.read_exact(&mut salt).map_err(io_to_integrity)?;
        let mut cs = [0u8; 4];
        reader.read_exact(&mut cs).map_err(io_to_integrity)?;
        let chunk_size = u32::from_le_bytes(cs);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ScratError::Integrity(format!(
                "declared chunk_size {chunk_size} out of range"
            )));
        }
        return Ok(SegmentPrelude {
            format: SegmentFormat::Chunked,
            salt,
            chunk_size,
        });
    }

    if head.starts_with(b"SCRAT") {
        return Err(ScratError::Integrity(format!(
            "unsupported segment format magic {:?}",
            String::from_utf8_lossy(&head)
        )));
    }

    // Legacy single-shot: no magic, the stream starts with the salt.
    let mut salt = [0u8; SALT_LEN];
    salt[..8].copy_from_slice(&head);
    reader.read_exact(&mut salt[8..]).map_err(io_to_integrity)?;
    Ok(SegmentPrelude {
        format: SegmentFormat::LegacySingleShot,
        salt,
        chunk_size: 0,
    })
}

/// Decrypting reader for one segment. Verifies each chunk's tag before any
/// of its plaintext is served; a tag failure discards the chunk buffer.
pub struct SegmentReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    chunk_size: u32,
    buf: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> SegmentReader<R> {
    pub fn new(inner: R, key: &MasterKey, prelude: &SegmentPrelude) -> Result<Self> {
        let mut reader = Self {
            inner,
            cipher: key.cipher(),
            chunk_size: prelude.chunk_size,
            buf: Vec::new(),
            pos: 0,
            finished: false,
        };

        if prelude.format == SegmentFormat::LegacySingleShot {
            reader.read_legacy()?;
        }
        Ok(reader)
    }

    /// Legacy payloads were produced in one shot; decrypt them the same way.
    fn read_legacy(&mut self) -> Result<()> {
        let mut nonce = [0u8; NONCE_LEN];
        self.inner.read_exact(&mut nonce).map_err(io_to_integrity)?;
        let mut sealed = Vec::new();
        self.inner.read_to_end(&mut sealed).map_err(io_to_integrity)?;
        if sealed.len() < TAG_LEN {
            return Err(ScratError::Integrity("legacy payload too short".into()));
        }
        self.buf = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| ScratError::Integrity("authentication tag mismatch".into()))?;
        self.finished = true;
        Ok(())
    }

    /// Read and verify the next chunk. Returns `false` after the trailer.
    fn next_chunk(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }

        let mut nonce = [0u8; NONCE_LEN];
        self.inner.read_exact(&mut nonce).map_err(io_to_integrity)?;
        let mut len_bytes = [0u8; 4];
        self.inner.read_exact(&mut len_bytes).map_err(io_to_integrity)?;
        let len = u32::from_le_bytes(len_bytes);

        if len == 0 {
            // Trailer: verify the empty chunk under the "end" AAD.
            let mut tag_bytes = [0u8; TAG_LEN];
            self.inner.read_exact(&mut tag_bytes).map_err(io_to_integrity)?;
            let mut empty = [0u8; 0];
            self.cipher
                .decrypt_in_place_detached(
                    Nonce::from_slice(&nonce),
                    TRAILER_AAD,
                    &mut empty,
                    Tag::from_slice(&tag_bytes),
                )
                .map_err(|_| ScratError::Integrity("segment trailer verification failed".into()))?;
            self.finished = true;
            self.buf.clear();
            self.pos = 0;
            return Ok(false);
        }

        if len > self.chunk_size {
            return Err(ScratError::Integrity(format!(
                "chunk length {len} exceeds declared chunk_size {}",
                self.chunk_size
            )));
        }

        self.buf.resize(len as usize, 0);
        self.inner.read_exact(&mut self.buf).map_err(io_to_integrity)?;
        let mut tag_bytes = [0u8; TAG_LEN];
        self.inner.read_exact(&mut tag_bytes).map_err(io_to_integrity)?;

        let verified = self.cipher.decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            &[],
            &mut self.buf,
            Tag::from_slice(&tag_bytes),
        );
        if verified.is_err() {
            // Never leak unauthenticated plaintext upstream.
            self.buf.clear();
            self.pos = 0;
            return Err(ScratError::Integrity("authentication tag mismatch".into()));
        }

        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for SegmentReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.buf.len() {
            if self.finished {
                return Ok(0);
            }
            match self.next_chunk() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(e) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        e.to_string(),
                    ))
                }
            }
        }

        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Seal a small in-memory document (manifest, catalog copy) in the chunked
/// format with a 1 MiB chunk size.
pub fn seal_bytes(key: &MasterKey, salt: &[u8; SALT_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut writer = SegmentWriter::new(
        Vec::new(),
        key,
        salt,
        super::key::generate_iv_seed(),
        1024 * 1024,
    )?;
    writer.write_all(plaintext)?;
    let (out, _stored) = writer.finish()?;
    Ok(out)
}

/// Decrypt a sealed document, deriving the key from the embedded salt.
/// Accepts both the chunked and the legacy single-shot layout.
pub fn open_bytes(passphrase: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(data);
    let prelude = read_prelude(&mut cursor)?;
    let key = MasterKey::derive(passphrase, &prelude.salt);
    let mut reader = SegmentReader::new(cursor, &key, &prelude)?;
    let mut plaintext = Vec::new();
    reader.read_to_end(&mut plaintext).map_err(io_to_integrity)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &str = "correct-horse-battery-staple";

    fn test_key() -> (MasterKey, [u8; SALT_LEN]) {
        let salt = [0x5Eu8; SALT_LEN];
        (MasterKey::derive(PASSPHRASE, &salt), salt)
    }

    fn roundtrip(plaintext: &[u8], chunk_size: u32) -> Vec<u8> {
        let (key, salt) = test_key();
        let mut writer =
            SegmentWriter::new(Vec::new(), &key, &salt, [9u8; NONCE_LEN], chunk_size).unwrap();
        writer.write_all(plaintext).unwrap();
        let (sealed, stored) = writer.finish().unwrap();
        assert_eq!(sealed.len() as u64, stored);

        let mut cursor = std::io::Cursor::new(sealed.as_slice());
        let prelude = read_prelude(&mut cursor).unwrap();
        assert_eq!(prelude.format, SegmentFormat::Chunked);
        assert_eq!(prelude.salt, salt);
        let mut reader = SegmentReader::new(cursor, &key, &prelude).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn empty_stream_roundtrip() {
        assert_eq!(roundtrip(b"", 1024), b"");
    }

    #[test]
    fn single_chunk_roundtrip() {
        assert_eq!(roundtrip(b"hello scrat", 1024), b"hello scrat");
    }

    #[test]
    fn multi_chunk_roundtrip() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        // Chunk size far smaller than the payload forces many chunks.
        assert_eq!(roundtrip(&data, 257), data);
    }

    #[test]
    fn exact_chunk_boundary_roundtrip() {
        let data = vec![0xABu8; 4096];
        assert_eq!(roundtrip(&data, 1024), data);
        assert_eq!(roundtrip(&data, 4096), data);
    }

    #[test]
    fn wrong_key_fails() {
        let (key, salt) = test_key();
        let mut writer =
            SegmentWriter::new(Vec::new(), &key, &salt, [9u8; NONCE_LEN], 1024).unwrap();
        writer.write_all(b"secret").unwrap();
        let (sealed, _) = writer.finish().unwrap();

        let wrong = MasterKey::derive("wrong-horse-battery-staple", &salt);
        let mut cursor = std::io::Cursor::new(sealed.as_slice());
        let prelude = read_prelude(&mut cursor).unwrap();
        let mut reader = SegmentReader::new(cursor, &wrong, &prelude).unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn bit_flip_is_detected() {
        let (key, salt) = test_key();
        let data = vec![0x42u8; 5000];
        let mut writer =
            SegmentWriter::new(Vec::new(), &key, &salt, [9u8; NONCE_LEN], 1024).unwrap();
        writer.write_all(&data).unwrap();
        let (mut sealed, _) = writer.finish().unwrap();

        // Flip one bit in the middle of the ciphertext body.
        let mid = sealed.len() / 2;
        sealed[mid] ^= 0x01;

        let mut cursor = std::io::Cursor::new(sealed.as_slice());
        let prelude = read_prelude(&mut cursor).unwrap();
        let mut reader = SegmentReader::new(cursor, &key, &prelude).unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn truncation_at_chunk_boundary_is_detected() {
        let (key, salt) = test_key();
        let data = vec![0x42u8; 3000];
        let mut writer =
            SegmentWriter::new(Vec::new(), &key, &salt, [9u8; NONCE_LEN], 1024).unwrap();
        writer.write_all(&data).unwrap();
        let (sealed, _) = writer.finish().unwrap();

        // Cut off the trailer (12 + 4 + 16 bytes).
        let cut = sealed.len() - (NONCE_LEN + 4 + TAG_LEN);
        let mut cursor = std::io::Cursor::new(&sealed[..cut]);
        let prelude = read_prelude(&mut cursor).unwrap();
        let mut reader = SegmentReader::new(cursor, &key, &prelude).unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn legacy_single_shot_is_accepted() {
        let (key, salt) = test_key();
        let nonce = [3u8; NONCE_LEN];
        let sealed = key
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), b"legacy payload".as_slice())
            .unwrap();

        let mut raw = Vec::new();
        raw.extend_from_slice(&salt);
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);

        let out = open_bytes(PASSPHRASE, &raw).unwrap();
        assert_eq!(out, b"legacy payload");
    }

    #[test]
    fn unknown_scrat_magic_is_rejected() {
        let mut raw = b"SCRAT099".to_vec();
        raw.extend_from_slice(&[0u8; 64]);
        let mut cursor = std::io::Cursor::new(raw.as_slice());
        assert!(matches!(
            read_prelude(&mut cursor),
            Err(ScratError::Integrity(_))
        ));
    }

    #[test]
    fn declared_chunk_size_is_honored() {
        let (key, salt) = test_key();
        // Writer with a non-default chunk size; reader takes it from the header.
        let mut writer =
            SegmentWriter::new(Vec::new(), &key, &salt, [9u8; NONCE_LEN], 333).unwrap();
        let data = vec![1u8; 1000];
        writer.write_all(&data).unwrap();
        let (sealed, _) = writer.finish().unwrap();

        let mut cursor = std::io::Cursor::new(sealed.as_slice());
        let prelude = read_prelude(&mut cursor).unwrap();
        assert_eq!(prelude.chunk_size, 333);
        let mut reader = SegmentReader::new(cursor, &key, &prelude).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn sealed_bytes_roundtrip() {
        let (key, salt) = test_key();
        let sealed = seal_bytes(&key, &salt, b"manifest body").unwrap();
        let out = open_bytes(PASSPHRASE, &sealed).unwrap();
        assert_eq!(out, b"manifest body");
    }

    #[test]
    fn zero_chunk_size_rejected_on_read() {
        let mut raw = MAGIC.to_vec();
        raw.extend_from_slice(&[0u8; SALT_LEN]);
        raw.extend_from_slice(&0u32.to_le_bytes());
        let mut cursor = std::io::Cursor::new(raw.as_slice());
        assert!(matches!(
            read_prelude(&mut cursor),
            Err(ScratError::Integrity(_))
        ));
    }
}
