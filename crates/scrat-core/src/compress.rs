use std::io::Read;

use crate::config::CompressionSetting;
use crate::error::{Result, ScratError};

pub const TAG_STORE: u8 = 0x00;
pub const TAG_LZ4: u8 = 0x01;
pub const TAG_ZSTD: u8 = 0x02;

/// Input block size the archiver feeds into the codec. Bounds peak memory
/// on both the compress and decompress side.
pub const BLOCK_SIZE: usize = 1024 * 1024;

/// Maximum decompressed output accepted for one block. Prevents
/// decompression bombs from consuming unbounded memory.
const MAX_DECOMPRESS_SIZE: u64 = 4 * BLOCK_SIZE as u64;

const ZSTD_LEVEL_BALANCED: i32 = 3;
const ZSTD_LEVEL_BEST: i32 = 19;

/// Concrete codec for one backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Store,
    Lz4,
    Zstd { level: i32 },
}

impl Codec {
    pub fn from_setting(setting: CompressionSetting) -> Self {
        match setting {
            CompressionSetting::None => Codec::Store,
            CompressionSetting::Fast => Codec::Lz4,
            CompressionSetting::Balanced => Codec::Zstd {
                level: ZSTD_LEVEL_BALANCED,
            },
            CompressionSetting::Best => Codec::Zstd {
                level: ZSTD_LEVEL_BEST,
            },
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Codec::Store => TAG_STORE,
            Codec::Lz4 => TAG_LZ4,
            Codec::Zstd { .. } => TAG_ZSTD,
        }
    }

    /// Codec for a stored tag. The zstd level only matters for encoding, so
    /// decoders reconstruct it as the balanced default.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            TAG_STORE => Ok(Codec::Store),
            TAG_LZ4 => Ok(Codec::Lz4),
            TAG_ZSTD => Ok(Codec::Zstd {
                level: ZSTD_LEVEL_BALANCED,
            }),
            other => Err(ScratError::Integrity(format!(
                "unknown compression tag: {other:#04x}"
            ))),
        }
    }
}

/// Compress one block.
pub fn compress_block(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::Store => Ok(data.to_vec()),
        Codec::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Codec::Zstd { level } => zstd::bulk::compress(data, level)
            .map_err(|e| ScratError::Internal(format!("zstd compress: {e}"))),
    }
}

/// Decompress one block, enforcing the output size cap.
pub fn decompress_block(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::Store => Ok(data.to_vec()),
        Codec::Lz4 => {
            if data.len() < 4 {
                return Err(ScratError::Integrity("lz4 block too short".into()));
            }
            let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64;
            if declared > MAX_DECOMPRESS_SIZE {
                return Err(ScratError::Integrity(format!(
                    "lz4 declared size {declared} exceeds limit {MAX_DECOMPRESS_SIZE}"
                )));
            }
            lz4_flex::decompress_size_prepended(data)
                .map_err(|e| ScratError::Integrity(format!("lz4 decode: {e}")))
        }
        Codec::Zstd { .. } => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(data))
                .map_err(|e| ScratError::Integrity(format!("zstd init: {e}")))?;
            let mut out = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut out)
                .map_err(|e| ScratError::Integrity(format!("zstd decode: {e}")))?;
            if out.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(ScratError::Integrity(format!(
                    "zstd output exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(out)
        }
    }
}
