//! Backing file header.
//!
//! Fixed little-endian layout at offset 0: 8-byte magic, `u32` version,
//! `i64` metadata anchor, `i64` free-list head, `u64` block watermark,
//! `u64` block size. The remainder of the `FILE_HEADER_SIZE` region is
//! unused; block 0 starts at `FILE_HEADER_SIZE`.

use cogstore_error::{CacheError, Result};
use cogstore_types::{
    read_fixed, read_le_i64, read_le_u32, read_le_u64, BlockId, FORMAT_VERSION, MAGIC_BYTES,
    MIN_FORMAT_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    pub version: u32,
    /// First block of the metadata chain, or INVALID.
    pub meta_block: BlockId,
    /// First block of the serialized free list, or INVALID.
    pub free_list: BlockId,
    /// Allocation watermark.
    pub block_count: u64,
    /// Immutable per-file block size.
    pub block_size: u64,
}

impl StoreHeader {
    /// Serialized length: magic + version + two chain heads + watermark +
    /// block size.
    pub const ENCODED_LEN: usize = 8 + 4 + 8 + 8 + 8 + 8;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0_u8; Self::ENCODED_LEN];
        out[0..8].copy_from_slice(&MAGIC_BYTES);
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..20].copy_from_slice(&self.meta_block.0.to_le_bytes());
        out[20..28].copy_from_slice(&self.free_list.0.to_le_bytes());
        out[28..36].copy_from_slice(&self.block_count.to_le_bytes());
        out[36..44].copy_from_slice(&self.block_size.to_le_bytes());
        out
    }

    /// Parse and validate a header region.
    ///
    /// A wrong magic or an unsupported version is fatal: the file is not a
    /// block cache file this build can read.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let magic: [u8; 8] =
            read_fixed(data, 0).map_err(|err| CacheError::Format(err.to_string()))?;
        if magic != MAGIC_BYTES {
            return Err(CacheError::Format(format!(
                "not a block cache file: bad magic {magic:02x?}"
            )));
        }

        let version = read_le_u32(data, 8).map_err(|err| CacheError::Format(err.to_string()))?;
        if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
            return Err(CacheError::Format(format!(
                "unsupported block cache format version {version} (supported: \
                 {MIN_FORMAT_VERSION}..={FORMAT_VERSION})"
            )));
        }

        let meta_block =
            read_le_i64(data, 12).map_err(|err| CacheError::Format(err.to_string()))?;
        let free_list =
            read_le_i64(data, 20).map_err(|err| CacheError::Format(err.to_string()))?;
        let block_count =
            read_le_u64(data, 28).map_err(|err| CacheError::Format(err.to_string()))?;
        let block_size =
            read_le_u64(data, 36).map_err(|err| CacheError::Format(err.to_string()))?;

        Ok(Self {
            version,
            meta_block: BlockId(meta_block),
            free_list: BlockId(free_list),
            block_count,
            block_size,
        })
    }
}
